//! Readiness/shutdown gate shared by both schedulers.
//!
//! The whole state is one atomic byte, so reads never take a lock and either
//! runtime may poll it. Waiters are parked on a [`Notify`], which is not tied
//! to a particular tokio runtime.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    Starting = 0,
    Ready = 1,
    Disconnected = 2,
    ShuttingDown = 3,
}

impl ReadinessState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadinessState::Starting,
            1 => ReadinessState::Ready,
            2 => ReadinessState::Disconnected,
            _ => ReadinessState::ShuttingDown,
        }
    }
}

#[derive(Debug)]
pub struct ReadinessGate {
    state: AtomicU8,
    changed: Notify,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ReadinessState::Starting as u8),
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() == ReadinessState::ShuttingDown
    }

    /// Starting/Disconnected -> Ready. No-op once shutting down.
    pub fn set_ready(&self) {
        if self.transition(
            |s| matches!(s, ReadinessState::Starting | ReadinessState::Disconnected),
            ReadinessState::Ready,
        ) {
            self.changed.notify_waiters();
        }
    }

    /// Ready -> Disconnected. Any other state is left alone.
    pub fn set_disconnected(&self) {
        if self.transition(|s| s == ReadinessState::Ready, ReadinessState::Disconnected) {
            self.changed.notify_waiters();
        }
    }

    /// Any state -> ShuttingDown (terminal for this gate).
    pub fn set_shutting_down(&self) {
        let prev = self
            .state
            .swap(ReadinessState::ShuttingDown as u8, Ordering::AcqRel);
        if prev != ReadinessState::ShuttingDown as u8 {
            self.changed.notify_waiters();
        }
    }

    /// Suspends until the gate reads Ready.
    ///
    /// If the gate reaches ShuttingDown first this keeps waiting; callers that
    /// must stop on shutdown race it against their cancellation token.
    pub async fn wait_until_ready(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before re-checking so a concurrent set_ready is not lost.
            notified.as_mut().enable();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, allowed: impl Fn(ReadinessState) -> bool, to: ReadinessState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = ReadinessState::from_u8(current);
            if state == to || !allowed(state) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
