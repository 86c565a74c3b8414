//! Core of the Greta chat bot.
//!
//! This crate is framework-agnostic. The chat platform lives behind the
//! [`ports::ChatClient`] port, implemented in an adapter crate; storage lives
//! behind [`store::QuoteStore`].
//!
//! The interesting part is the concurrency core: a [`gate`] shared by two
//! schedulers, the [`bridge`] between them, the bounded log [`relay`], the
//! [`supervisor`] that owns each run's background tasks, predicate [`wait`]s on
//! the event hub, and the outer [`retry`] loop.

pub mod app;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod gate;
pub mod handlers;
pub mod logging;
pub mod ports;
pub mod relay;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod wait;

pub use errors::{Error, Result};
