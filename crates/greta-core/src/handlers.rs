//! Event handlers registered on the hub at startup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    app::BotContext,
    bridge::SchedulerKind,
    commands::CommandRegistry,
    domain::IncomingMessage,
    events::{BotEvent, EventHandler, EventHub, EventKind},
    Result,
};

/// Registers every handler of the bot on `hub`.
pub fn register_all(hub: &EventHub, ctx: &BotContext, commands: Arc<CommandRegistry>) {
    hub.on(EventKind::Ready, Arc::new(Connected { ctx: ctx.clone() }));
    hub.on(EventKind::Disconnected, Arc::new(Disconnected { ctx: ctx.clone() }));
    hub.on(
        EventKind::Message,
        Arc::new(Messages {
            ctx: ctx.clone(),
            commands,
        }),
    );
}

/// Sent once when nobody answers the mention question in time.
pub const NO_ANSWER: &str = "Nobody answered, never mind then.";

/// Maps a yes/no style answer to a bool.
pub fn input_to_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "yes" | "y" | "yeah" | "ja" | "j" => Some(true),
        "no" | "n" | "nah" | "nein" => Some(false),
        _ => None,
    }
}

struct Connected {
    ctx: BotContext,
}

#[async_trait]
impl EventHandler for Connected {
    async fn handle(&self, _event: &BotEvent) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.gate().is_shutting_down() {
            return Ok(());
        }
        ctx.gate().set_ready();
        tracing::info!(username = %ctx.identity().username, "connected");

        let seeder = ctx.clone();
        ctx.bridge().submit(SchedulerKind::Worker, async move {
            match seeder.store().seed_global_quotes().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(added = n, "global quotes seeded"),
                Err(e) => tracing::warn!(error = %e, "seeding global quotes failed"),
            }
        });
        Ok(())
    }
}

struct Disconnected {
    ctx: BotContext,
}

#[async_trait]
impl EventHandler for Disconnected {
    async fn handle(&self, _event: &BotEvent) -> Result<()> {
        self.ctx.gate().set_disconnected();
        tracing::warn!("disconnected from the chat service");
        Ok(())
    }
}

struct Messages {
    ctx: BotContext,
    commands: Arc<CommandRegistry>,
}

#[async_trait]
impl EventHandler for Messages {
    async fn handle(&self, event: &BotEvent) -> Result<()> {
        let Some(msg) = event.as_message() else {
            return Ok(());
        };
        if msg.author_is_bot {
            return Ok(());
        }
        tracing::debug!(chat = msg.chat_id.0, message = msg.message_id.0, "processing message");
        let ctx = &self.ctx;

        if self.commands.dispatch(ctx, msg).await? {
            return Ok(());
        }

        if !msg.is_private() {
            if let Some(quote) = ctx.store().lookup(msg.chat_id, &msg.text).await? {
                return ctx.send_message_both(msg.chat_id, &quote.text).await;
            }
        }

        if msg.mentions(&ctx.identity().username) {
            // Runs detached: the answer arrives through this same handler.
            let flow_ctx = ctx.clone();
            let msg = msg.clone();
            ctx.bridge().submit(SchedulerKind::Client, async move {
                if let Err(e) = mention_flow(&flow_ctx, &msg).await {
                    tracing::warn!(error = %e, chat = msg.chat_id.0, "mention flow failed");
                }
            });
            return Ok(());
        }

        if msg.is_private() && ctx.config().is_owner(msg.author) && !self.commands.is_command(&msg.text)
        {
            if let Some(main) = ctx.main_chat() {
                return ctx.send_message_both(main, &msg.text).await;
            }
        }
        Ok(())
    }
}

async fn mention_flow(ctx: &BotContext, msg: &IncomingMessage) -> Result<()> {
    ctx.send_message_both(msg.chat_id, "Can I help you with anything?")
        .await?;

    let author = msg.author;
    let chat = msg.chat_id;
    let outcome = ctx
        .wait_for_event_both(
            EventKind::Message,
            move |e| {
                e.as_message().is_some_and(|m| {
                    m.author == author && m.chat_id == chat && input_to_bool(&m.text).is_some()
                })
            },
            ctx.config().event_wait,
        )
        .await?;

    let Some(answer) = outcome
        .matched()
        .and_then(|e| e.as_message().and_then(|m| input_to_bool(&m.text)))
    else {
        tracing::debug!(chat = chat.0, "no answer to mention");
        return ctx.send_message_both(chat, NO_ANSWER).await;
    };

    let reply = if answer {
        format!(
            "Okay, use the {}help command to get a list of my commands!",
            ctx.config().command_prefix
        )
    } else {
        format!("Oh my love... Then maybe don't ping me, {}? ;/", msg.author_name)
    };
    ctx.send_message_both(chat, &reply).await
}
