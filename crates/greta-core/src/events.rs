//! Event hub: the explicit handler registry plus the table of pending waits.
//!
//! The chat adapter calls [`EventHub::dispatch`] for every event it receives.
//! Pending waits are resolved first, then the registered handlers run in
//! registration order.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    domain::{IncomingMessage, ReactionAdded},
    Result,
};

#[derive(Clone, Debug)]
pub enum BotEvent {
    Ready,
    Disconnected,
    Message(IncomingMessage),
    Reaction(ReactionAdded),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Disconnected,
    Message,
    Reaction,
}

impl BotEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BotEvent::Ready => EventKind::Ready,
            BotEvent::Disconnected => EventKind::Disconnected,
            BotEvent::Message(_) => EventKind::Message,
            BotEvent::Reaction(_) => EventKind::Reaction,
        }
    }

    pub fn as_message(&self) -> Option<&IncomingMessage> {
        match self {
            BotEvent::Message(m) => Some(m),
            _ => None,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BotEvent) -> Result<()>;
}

pub type Predicate = Box<dyn Fn(&BotEvent) -> bool + Send + Sync>;

/// A registered wait: resolved or discarded exactly once.
pub(crate) struct PendingWait {
    kind: EventKind,
    predicate: Predicate,
    deadline: Instant,
    slot: oneshot::Sender<BotEvent>,
}

/// A predicate that panicked mid-dispatch must not disable the hub.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct EventHub {
    handlers: Mutex<Vec<(EventKind, Arc<dyn EventHandler>)>>,
    waits: Mutex<BTreeMap<u64, PendingWait>>,
    next_wait: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        locked(&self.handlers).push((kind, handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        locked(&self.handlers)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn pending_waits(&self) -> usize {
        locked(&self.waits).len()
    }

    /// Delivers one event: resolves matching waits, then runs handlers.
    ///
    /// Handler errors are logged; they never stop delivery to the next handler.
    pub async fn dispatch(&self, event: BotEvent) {
        let kind = event.kind();
        self.resolve_waits(&event);

        let handlers: Vec<Arc<dyn EventHandler>> = locked(&self.handlers)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                tracing::warn!(?kind, error = %e, error_kind = e.as_label(), "event handler failed");
            }
        }
    }

    pub(crate) fn register(
        &self,
        kind: EventKind,
        predicate: Predicate,
        deadline: Instant,
        slot: oneshot::Sender<BotEvent>,
    ) -> u64 {
        let id = self.next_wait.fetch_add(1, Ordering::Relaxed);
        locked(&self.waits).insert(
            id,
            PendingWait {
                kind,
                predicate,
                deadline,
                slot,
            },
        );
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        locked(&self.waits).remove(&id);
    }

    fn resolve_waits(&self, event: &BotEvent) {
        let kind = event.kind();
        let now = Instant::now();
        let mut waits = locked(&self.waits);

        let matched: Vec<u64> = waits
            .iter()
            .filter(|(_, w)| w.kind == kind && w.deadline > now && (w.predicate)(event))
            .map(|(id, _)| *id)
            .collect();

        for id in matched {
            if let Some(wait) = waits.remove(&id) {
                // The waiter may have given up between the scan and now.
                let _ = wait.slot.send(event.clone());
            }
        }
    }
}
