//! Long polling loop: turns Telegram updates into hub events.
//!
//! Connection state is reported to the hub as `Ready` / `Disconnected`. Polling
//! failures are retried in place; after [`MAX_FAILED_POLLS`] in a row, or a
//! rejected token, the loop ends with an error so the outer retry loop takes
//! over.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use teloxide::{
    dispatching::ShutdownToken, error_handlers::ErrorHandler, prelude::*, types::Message,
    update_listeners, RequestError,
};
use tokio_util::sync::CancellationToken;

use greta_core::{
    domain::{ChatId, ChatKind, IncomingMessage, MessageId, UserId},
    errors::Error,
    events::{BotEvent, EventHub},
    Result,
};

use crate::map_err;

pub const MAX_FAILED_POLLS: u32 = 20;
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);
const RECONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Shared between the dispatcher endpoints, the polling error handler and the watcher.
struct Link {
    hub: Arc<EventHub>,
    online: AtomicBool,
    failures: AtomicU32,
    fatal: Mutex<Option<Error>>,
    lost: CancellationToken,
}

impl Link {
    fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            online: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            fatal: Mutex::new(None),
            lost: CancellationToken::new(),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn mark_online(&self) {
        self.failures.store(0, Ordering::SeqCst);
        if !self.online.swap(true, Ordering::SeqCst) {
            tracing::info!("telegram polling connected");
            self.hub.dispatch(BotEvent::Ready).await;
        }
    }

    async fn poll_failed(&self, e: RequestError) {
        let err = map_err(e);
        if err.is_fatal() {
            self.give_up(err);
            return;
        }

        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(error = %err, failures, "telegram polling failed");
        if self.online.swap(false, Ordering::SeqCst) {
            self.hub.dispatch(BotEvent::Disconnected).await;
        }
        if failures >= MAX_FAILED_POLLS {
            self.give_up(Error::Transport(format!(
                "telegram polling failed {failures} times in a row: {err}"
            )));
            return;
        }

        tokio::select! {
            _ = self.lost.cancelled() => {}
            _ = tokio::time::sleep(POLL_ERROR_PAUSE) => {}
        }
    }

    fn give_up(&self, err: Error) {
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(err);
        }
        self.lost.cancel();
    }

    fn take_error(&self) -> Option<Error> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }
}

struct PollErrors {
    link: Arc<Link>,
}

impl ErrorHandler<RequestError> for PollErrors {
    fn handle_error(
        self: Arc<Self>,
        error: RequestError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(async move { self.link.poll_failed(error).await })
    }
}

/// Polls until `cancel` fires (`Ok`) or the connection is lost for good (`Err`).
pub(crate) async fn poll(bot: Bot, hub: Arc<EventHub>, cancel: CancellationToken) -> Result<()> {
    let link = Arc::new(Link::new(hub));

    let handler = dptree::entry().branch(Update::filter_message().endpoint(on_message));
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![link.clone()])
        .default_handler(|_| async {})
        .build();

    let listener = update_listeners::polling_default(bot.clone()).await;
    let watcher = tokio::spawn(watch(
        bot,
        link.clone(),
        cancel.clone(),
        dispatcher.shutdown_token(),
    ));

    link.mark_online().await;
    dispatcher
        .dispatch_with_listener(listener, Arc::new(PollErrors { link: link.clone() }))
        .await;
    watcher.abort();

    if cancel.is_cancelled() {
        tracing::info!("telegram polling stopped");
        return Ok(());
    }
    Err(link
        .take_error()
        .unwrap_or_else(|| Error::Transport("telegram polling stopped unexpectedly".to_string())))
}

/// Checks the API while offline and stops the dispatcher on cancel or loss.
async fn watch(bot: Bot, link: Arc<Link>, cancel: CancellationToken, token: ShutdownToken) {
    let mut check = tokio::time::interval(RECONNECT_CHECK_INTERVAL);
    check.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = link.lost.cancelled() => break,
            _ = check.tick() => {
                if !link.is_online() && bot.get_me().await.is_ok() {
                    link.mark_online().await;
                }
            }
        }
    }

    // The dispatcher refuses to stop before it has started.
    loop {
        match token.shutdown() {
            Ok(stopped) => {
                stopped.await;
                return;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

async fn on_message(msg: Message, link: Arc<Link>) -> ResponseResult<()> {
    link.mark_online().await;
    if let Some(incoming) = incoming_from(&msg) {
        link.hub.dispatch(BotEvent::Message(incoming)).await;
    }
    Ok(())
}

/// Converts a Telegram message into the core's message type. Service messages
/// and messages without text or author yield `None`.
pub fn incoming_from(msg: &Message) -> Option<IncomingMessage> {
    let user = msg.from()?;
    let text = msg.text().or_else(|| msg.caption())?;

    Some(IncomingMessage {
        chat_id: ChatId(msg.chat.id.0),
        chat_kind: if msg.chat.is_private() {
            ChatKind::Private
        } else {
            ChatKind::Group
        },
        message_id: MessageId(msg.id.0),
        author: UserId(user.id.0 as i64),
        author_name: user
            .username
            .clone()
            .unwrap_or_else(|| user.first_name.clone()),
        author_is_bot: user.is_bot,
        text: text.to_string(),
        mentions: extract_mentions(text),
    })
}

/// `@name` mentions in `text`, without the `@`.
pub fn extract_mentions(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|w| w.strip_prefix('@'))
        .map(|w| {
            w.trim_end_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}
