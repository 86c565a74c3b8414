//! Bounded log relay: outbound diagnostics from any call site to one consumer task.
//!
//! Producers never wait. A full or closed relay refuses the envelope and counts
//! it, as does the consumer for whatever is still buffered when it stops. The
//! consumer forwards envelopes to a [`LogSink`] with a fixed pause between sends.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{gate::ReadinessGate, logging::INTERNAL_TARGET, Error, Result};

pub const DEFAULT_CAPACITY: usize = 10;

/// One relayed log line. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEnvelope {
    text: String,
}

impl LogEnvelope {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug)]
pub struct LogSender {
    tx: mpsc::Sender<LogEnvelope>,
    shared: Arc<Shared>,
}

pub struct LogReceiver {
    rx: mpsc::Receiver<LogEnvelope>,
    shared: Arc<Shared>,
}

/// Creates a relay holding at most `capacity` envelopes.
pub fn log_relay(capacity: usize) -> (LogSender, LogReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        LogSender {
            tx,
            shared: shared.clone(),
        },
        LogReceiver { rx, shared },
    )
}

impl LogSender {
    /// Queues `text` if there is room. Never blocks; returns whether it was queued.
    pub fn try_send(&self, text: impl Into<String>) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.count_dropped(1);
            return false;
        }
        match self.tx.try_send(LogEnvelope::new(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.shared.count_dropped(1);
                false
            }
        }
    }

    /// Closes the send side for every clone of this sender.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Envelopes that never reached the sink: refused while full or closed,
    /// or discarded from the buffer at shutdown.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl LogReceiver {
    #[cfg(test)]
    pub(crate) fn try_next_text(&mut self) -> Option<String> {
        self.rx.try_recv().ok().map(|env| env.text)
    }
}

/// Where relayed log lines end up (a chat channel in production).
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn forward(&self, text: &str) -> Result<()>;
}

/// The consumer loop, run as one supervised background task.
///
/// Forwards one envelope per `interval` while the gate is Ready, holds the
/// current envelope while Starting/Disconnected, and on shutdown discards what
/// is still buffered and closes the relay.
pub async fn drain(
    mut receiver: LogReceiver,
    gate: Arc<ReadinessGate>,
    sink: Arc<dyn LogSink>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut forwarded = 0u64;
    let mut discarded = 0u64;
    let outcome = loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            env = receiver.rx.recv() => match env {
                Some(env) => env,
                None => break Ok(()),
            },
        };

        if gate.is_shutting_down() {
            discarded += 1;
            break Ok(());
        }
        if !gate.is_ready() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    discarded += 1;
                    break Ok(());
                }
                _ = gate.wait_until_ready() => {}
            }
        }

        match sink.forward(envelope.text()).await {
            Ok(()) => forwarded += 1,
            Err(Error::Cancelled) => break Ok(()),
            Err(e) if e.is_recoverable() => break Err(e),
            Err(e) => {
                tracing::debug!(target: INTERNAL_TARGET, error = %e, "log relay forward failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    };

    receiver.shared.closed.store(true, Ordering::Release);
    receiver.rx.close();
    while receiver.rx.try_recv().is_ok() {
        discarded += 1;
    }
    receiver.shared.count_dropped(discarded);
    tracing::debug!(
        target: INTERNAL_TARGET,
        forwarded,
        discarded,
        dropped = receiver.shared.dropped.load(Ordering::Relaxed),
        "log relay consumer stopped"
    );

    outcome
}
