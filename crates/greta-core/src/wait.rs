//! Predicate event wait.
//!
//! A wait registers a predicate with the [`EventHub`], suspends, and resumes
//! with the first matching event or [`WaitOutcome::TimedOut`]. The registration
//! is removed on every exit path, including the caller being dropped.

use std::time::Duration;

use tokio::{sync::oneshot, time::Instant};

use crate::events::{BotEvent, EventHub, EventKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome<E> {
    Matched(E),
    TimedOut,
}

impl<E> WaitOutcome<E> {
    pub fn matched(self) -> Option<E> {
        match self {
            WaitOutcome::Matched(e) => Some(e),
            WaitOutcome::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }
}

struct Registration<'a> {
    hub: &'a EventHub,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

impl EventHub {
    /// Waits for the first event of `kind` satisfying `predicate`.
    pub async fn wait_for<P>(
        &self,
        kind: EventKind,
        predicate: P,
        timeout: Duration,
    ) -> WaitOutcome<BotEvent>
    where
        P: Fn(&BotEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let _registration = Registration {
            hub: self,
            id: self.register(kind, Box::new(predicate), deadline, tx),
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(event)) => WaitOutcome::Matched(event),
            Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
        }
    }
}
