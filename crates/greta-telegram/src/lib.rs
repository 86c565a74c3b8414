//! Telegram adapter (teloxide).
//!
//! This crate implements the `greta-core` [`ChatClient`] port over the Telegram
//! Bot API using long polling.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::{prelude::*, ApiError, RequestError};
use tokio::{sync::Mutex, time::sleep};
use tokio_util::sync::CancellationToken;

mod updates;

pub use updates::{extract_mentions, incoming_from};

use greta_core::{
    domain::{BotIdentity, ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    events::EventHub,
    ports::ChatClient,
    Result,
};

#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
    status_chat: Option<ChatId>,
    /// Message in the status chat that carries the status line.
    status_msg: Arc<Mutex<Option<MessageRef>>>,
}

impl TelegramClient {
    pub fn new(token: &str, status_chat: Option<ChatId>) -> Self {
        Self {
            bot: Bot::new(token),
            status_chat,
            status_msg: Arc::new(Mutex::new(None)),
        }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(map_err(other)),
                },
            }
        }
    }
}

/// Maps a Bot API failure onto the core error taxonomy.
pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => {
            Error::Auth("telegram rejected the bot token".to_string())
        }
        RequestError::Api(api @ (ApiError::BotBlocked | ApiError::BotKicked)) => {
            Error::Permission(api.to_string())
        }
        // Server-side failures surface as descriptions teloxide does not know
        // or as non-JSON bodies (HTML error pages from the gateway).
        RequestError::Api(ApiError::Unknown(desc)) => {
            Error::Transport(format!("telegram api failure: {desc}"))
        }
        e @ RequestError::InvalidJson { .. } => {
            Error::Transport(format!("telegram sent an unreadable response: {e}"))
        }
        RequestError::RetryAfter(d) => Error::RateLimited(d),
        RequestError::Network(e) => Error::Transport(format!("telegram network error: {e}")),
        RequestError::Io(e) => Error::Transport(format!("telegram io error: {e}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn identity(&self) -> Result<BotIdentity> {
        let me = self.with_retry(|| self.bot.get_me()).await?;
        Ok(BotIdentity {
            user_id: UserId(me.user.id.0 as i64),
            username: me.username().to_string(),
        })
    }

    async fn run(&self, hub: Arc<EventHub>, cancel: CancellationToken) -> Result<()> {
        updates::poll(self.bot.clone(), hub, cancel).await
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| self.bot.send_message(Self::tg_chat(chat_id), text.to_string()))
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn set_status_text(&self, text: &str) -> Result<()> {
        // Bots have no presence line; the status lives in one message that is edited in place.
        let Some(chat) = self.status_chat else {
            tracing::debug!(status = text, "no status chat configured");
            return Ok(());
        };

        let mut current = self.status_msg.lock().await;
        if let Some(msg) = *current {
            let edited = self
                .with_retry(|| {
                    self.bot.edit_message_text(
                        Self::tg_chat(msg.chat_id),
                        Self::tg_msg_id(msg.message_id),
                        text.to_string(),
                    )
                })
                .await;
            match edited {
                Ok(_) => return Ok(()),
                Err(Error::External(e)) if e.contains("not modified") => return Ok(()),
                Err(e) if e.is_recoverable() => return Err(e),
                // Deleted or too old to edit: post a fresh one.
                Err(e) => tracing::debug!(error = %e, "status message not editable"),
            }
        }

        *current = Some(self.send_text(chat, text).await?);
        Ok(())
    }
}
