use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{domain::*, events::EventHub, Result};

/// Hexagonal port for the chat platform client.
///
/// Implementations are driven from the client scheduler only; callers on the
/// worker scheduler reach them through the bridge.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Who we are logged in as. Fails with `Error::Auth` on bad credentials.
    async fn identity(&self) -> Result<BotIdentity>;

    /// Connects and feeds every received event into `hub` until `cancel` fires.
    ///
    /// Returns `Ok(())` only after cancellation. Losing the connection for good
    /// is a `Transport` error.
    async fn run(&self, hub: Arc<EventHub>, cancel: CancellationToken) -> Result<()>;

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageRef>;

    /// Updates the bot's public status line.
    async fn set_status_text(&self, text: &str) -> Result<()>;
}
