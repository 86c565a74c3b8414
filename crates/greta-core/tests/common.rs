//! Fakes shared by the run lifecycle tests.
//!
//! One event log is shared by the fake chat client and the recording store so
//! tests can assert ordering across both.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use greta_core::{
    config::Config,
    domain::{BotIdentity, ChatId, ChatKind, IncomingMessage, MessageId, MessageRef, UserId},
    events::{BotEvent, EventHub},
    ports::ChatClient,
    runtime::RunDeps,
    store::{Quote, QuoteScope, QuoteStore},
    Error, Result,
};
use tokio_util::sync::CancellationToken;

pub const OWNER: i64 = 1;
pub const GROUP: i64 = -100;
pub const BOT_NAME: &str = "greta_bot";

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn entries(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn position(log: &EventLog, entry: &str) -> usize {
    entries(log)
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not in {:?}", entries(log)))
}

pub fn test_config() -> Arc<Config> {
    let vars: HashMap<&str, &str> = [
        ("GRETA_BOT_TOKEN", "123:test"),
        ("GRETA_OWNERS", "1"),
        ("GRETA_MAIN_CHAT", "-200"),
        ("GRETA_STATUS_INITIAL_DELAY_SECS", "0"),
        ("GRETA_STATUS_PERIOD_SECS", "3600"),
        ("GRETA_LOG_RELAY_INTERVAL_MS", "0"),
        ("GRETA_EVENT_WAIT_SECS", "1"),
        ("GRETA_RETRY_DELAY_SECS", "0"),
    ]
    .into_iter()
    .collect();
    Arc::new(Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap())
}

/// How one call to `run` behaves.
#[derive(Clone, Copy, Debug)]
pub enum RunBehavior {
    /// Stay connected until cancelled, then take `linger` to stop.
    UntilCancelled { linger: Duration },
    /// Lose the connection after the given time.
    FailAfter(Duration),
}

pub struct FakeChatClient {
    log: EventLog,
    auth_fails: bool,
    behaviors: Mutex<VecDeque<RunBehavior>>,
    hub: Mutex<Option<Arc<EventHub>>>,
    sent: Mutex<Vec<(ChatId, String)>>,
    statuses: Mutex<Vec<String>>,
    runs: Mutex<usize>,
}

impl FakeChatClient {
    pub fn new(log: EventLog, behaviors: Vec<RunBehavior>) -> Arc<Self> {
        Arc::new(Self {
            log,
            auth_fails: false,
            behaviors: Mutex::new(behaviors.into()),
            hub: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            runs: Mutex::new(0),
        })
    }

    pub fn rejecting_credentials(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            auth_fails: true,
            behaviors: Mutex::new(VecDeque::new()),
            hub: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            runs: Mutex::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    /// Waits until `run` has been entered and returns the hub it was given.
    pub async fn connected_hub(&self) -> Arc<EventHub> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(hub) = self.hub.lock().unwrap().clone() {
                    return hub;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client never connected")
    }

    pub async fn wait_for_sent(&self, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.sent_texts().iter().any(|t| t.contains(needle)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never sent {needle:?}; sent {:?}", self.sent_texts()));
    }

    fn record(&self, entry: &str) {
        self.log.lock().unwrap().push(entry.to_string());
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    async fn identity(&self) -> Result<BotIdentity> {
        self.record("client:identity");
        if self.auth_fails {
            return Err(Error::Auth("token rejected".into()));
        }
        Ok(BotIdentity {
            user_id: UserId(999),
            username: BOT_NAME.to_string(),
        })
    }

    async fn run(&self, hub: Arc<EventHub>, cancel: CancellationToken) -> Result<()> {
        *self.runs.lock().unwrap() += 1;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunBehavior::UntilCancelled {
                linger: Duration::ZERO,
            });
        self.record("client:run");
        hub.dispatch(BotEvent::Ready).await;
        *self.hub.lock().unwrap() = Some(hub);

        let out = match behavior {
            RunBehavior::UntilCancelled { linger } => {
                cancel.cancelled().await;
                tokio::time::sleep(linger).await;
                Ok(())
            }
            RunBehavior::FailAfter(after) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(after) => Err(Error::Transport("connection reset".into())),
                }
            }
        };
        *self.hub.lock().unwrap() = None;
        self.record("client:stopped");
        out
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat, text.to_string()));
        Ok(MessageRef {
            chat_id: chat,
            message_id: MessageId(sent.len() as i32),
        })
    }

    async fn set_status_text(&self, text: &str) -> Result<()> {
        self.statuses.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// In-memory quote store that records lifecycle calls.
pub struct RecordingStore {
    log: EventLog,
    connect_error: Mutex<Option<Error>>,
    quotes: Mutex<Vec<Quote>>,
}

impl RecordingStore {
    pub fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            connect_error: Mutex::new(None),
            quotes: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_connect(log: EventLog, err: Error) -> Arc<Self> {
        Arc::new(Self {
            log,
            connect_error: Mutex::new(Some(err)),
            quotes: Mutex::new(Vec::new()),
        })
    }

    pub fn quote_count(&self) -> usize {
        self.quotes.lock().unwrap().len()
    }

    fn record(&self, entry: &str) {
        self.log.lock().unwrap().push(entry.to_string());
    }
}

impl QuoteStore for RecordingStore {
    fn connect(&self) -> Result<()> {
        self.record("store:connect");
        match self.connect_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn create_schema(&self) -> Result<()> {
        self.record("store:create_schema");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.record("store:close");
        Ok(())
    }

    fn find_quote(&self, scope: QuoteScope, keyword: &str) -> Result<Option<Quote>> {
        Ok(self
            .quotes
            .lock()
            .unwrap()
            .iter()
            .find(|q| q.scope == scope && q.keyword == keyword)
            .cloned())
    }

    fn add_quote(&self, quote: Quote) -> Result<bool> {
        let mut quotes = self.quotes.lock().unwrap();
        quotes.retain(|q| !(q.scope == quote.scope && q.keyword == quote.keyword));
        quotes.push(quote);
        Ok(true)
    }

    fn delete_quote(&self, scope: QuoteScope, keyword: &str) -> Result<bool> {
        let mut quotes = self.quotes.lock().unwrap();
        let before = quotes.len();
        quotes.retain(|q| !(q.scope == scope && q.keyword == keyword));
        Ok(quotes.len() != before)
    }

    fn list_quotes(&self, scope: QuoteScope) -> Result<Vec<Quote>> {
        Ok(self
            .quotes
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.scope == scope)
            .cloned()
            .collect())
    }
}

pub fn deps(client: Arc<FakeChatClient>, store: Arc<RecordingStore>) -> Arc<RunDeps> {
    Arc::new(RunDeps {
        config: test_config(),
        client,
        store,
        shutdown: CancellationToken::new(),
    })
}

pub fn message(chat: i64, author: i64, text: &str) -> BotEvent {
    BotEvent::Message(IncomingMessage {
        chat_id: ChatId(chat),
        chat_kind: if chat == author {
            ChatKind::Private
        } else {
            ChatKind::Group
        },
        message_id: MessageId(7),
        author: UserId(author),
        author_name: format!("user{author}"),
        author_is_bot: false,
        text: text.to_string(),
        mentions: text
            .split_whitespace()
            .filter_map(|w| w.strip_prefix('@'))
            .map(str::to_string)
            .collect(),
    })
}
