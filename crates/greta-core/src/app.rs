//! Per-run application context handed to every event handler and command.
//!
//! The `*_both` helpers may be called from either scheduler; anything that
//! touches the chat client is marshalled onto the client scheduler.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    bridge::{Bridge, SchedulerKind},
    config::Config,
    domain::{BotIdentity, ChatId},
    events::{BotEvent, EventHub, EventKind},
    gate::ReadinessGate,
    ports::ChatClient,
    retry::RunExit,
    store::QuoteStoreHandle,
    wait::WaitOutcome,
    Error, Result,
};

/// Longest chunk sent in one message.
pub const CHUNK_LEN: usize = 1950;
/// Pause between chunks of one long message.
pub const CHUNK_PAUSE: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct BotContext {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    gate: Arc<ReadinessGate>,
    bridge: Bridge,
    client: Arc<dyn ChatClient>,
    hub: Arc<EventHub>,
    store: QuoteStoreHandle,
    identity: BotIdentity,
    scope: CancellationToken,
    exit: AtomicU8,
    /// Where owner DMs are forwarded. Starts from config, changed by `setchannel`.
    main_chat: Mutex<Option<ChatId>>,
}

const EXIT_SHUTDOWN: u8 = 0;
const EXIT_RESTART: u8 = 1;

pub struct BotContextParts {
    pub config: Arc<Config>,
    pub gate: Arc<ReadinessGate>,
    pub bridge: Bridge,
    pub client: Arc<dyn ChatClient>,
    pub hub: Arc<EventHub>,
    pub store: QuoteStoreHandle,
    pub identity: BotIdentity,
    pub scope: CancellationToken,
}

impl BotContext {
    pub fn new(parts: BotContextParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                main_chat: Mutex::new(parts.config.main_chat),
                config: parts.config,
                gate: parts.gate,
                bridge: parts.bridge,
                client: parts.client,
                hub: parts.hub,
                store: parts.store,
                identity: parts.identity,
                scope: parts.scope,
                exit: AtomicU8::new(EXIT_SHUTDOWN),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.inner.gate
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.inner.hub
    }

    pub fn store(&self) -> &QuoteStoreHandle {
        &self.inner.store
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.inner.identity
    }

    pub fn main_chat(&self) -> Option<ChatId> {
        *self
            .inner
            .main_chat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Redirects owner DMs to `chat` for the rest of this run.
    pub fn set_main_chat(&self, chat: ChatId) {
        *self
            .inner
            .main_chat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(chat);
    }

    /// Ends the current run. `Restart` makes the retry loop start a new one at once.
    pub fn request_exit(&self, exit: RunExit) {
        let code = match exit {
            RunExit::Shutdown => EXIT_SHUTDOWN,
            RunExit::Restart => EXIT_RESTART,
        };
        self.inner.exit.store(code, Ordering::Release);
        self.inner.scope.cancel();
    }

    pub fn requested_exit(&self) -> RunExit {
        match self.inner.exit.load(Ordering::Acquire) {
            EXIT_RESTART => RunExit::Restart,
            _ => RunExit::Shutdown,
        }
    }

    /// Sends `text` to `chat`, split into chunks with a pause between them.
    ///
    /// Silently does nothing once shutdown has begun.
    pub async fn send_message_both(&self, chat: ChatId, text: &str) -> Result<()> {
        for (i, chunk) in split_chunks(text, CHUNK_LEN).into_iter().enumerate() {
            if self.inner.gate.is_shutting_down() {
                return Ok(());
            }
            if i > 0 {
                self.sleep_both(CHUNK_PAUSE).await?;
            }
            let client = self.inner.client.clone();
            self.inner
                .bridge
                .call(SchedulerKind::Client, move || async move {
                    client.send_text(chat, &chunk).await
                })
                .await??;
        }
        Ok(())
    }

    /// Sleeps on whichever scheduler the caller is on. Cut short by shutdown.
    pub async fn sleep_both(&self, duration: Duration) -> Result<()> {
        if SchedulerKind::current().is_none() {
            return Err(Error::NoScheduler);
        }
        tokio::select! {
            _ = self.inner.scope.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Waits for an event on the client scheduler, from either scheduler.
    pub async fn wait_for_event_both<P>(
        &self,
        kind: EventKind,
        predicate: P,
        timeout: Duration,
    ) -> Result<WaitOutcome<BotEvent>>
    where
        P: Fn(&BotEvent) -> bool + Send + Sync + 'static,
    {
        let hub = self.inner.hub.clone();
        self.inner
            .bridge
            .call(SchedulerKind::Client, move || async move {
                hub.wait_for(kind, predicate, timeout).await
            })
            .await
    }

    /// Updates the status line. Does nothing until the gate has been Ready.
    pub async fn set_status_text_both(&self, text: &str) -> Result<()> {
        if !self.inner.gate.is_ready() {
            tracing::debug!("status text skipped: not ready");
            return Ok(());
        }
        let client = self.inner.client.clone();
        let text = text.to_string();
        self.inner
            .bridge
            .call(SchedulerKind::Client, move || async move {
                client.set_status_text(&text).await
            })
            .await?
    }
}

/// Splits `text` into pieces of at most `max_chars` characters.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}
