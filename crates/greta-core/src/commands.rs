//! Explicit command registry. Populated once per run, before the gate opens.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    app::BotContext,
    domain::IncomingMessage,
    retry::RunExit,
    store::{Quote, QuoteScope},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Anyone,
    /// Listed in `GRETA_OWNERS`.
    Owner,
    /// Only inside group chats.
    GroupMember,
}

#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;
    fn help(&self) -> &'static str;
    fn permission(&self) -> Permission {
        Permission::Anyone
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, args: &str) -> Result<()>;
}

pub struct CommandRegistry {
    prefix: String,
    commands: BTreeMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in command.
    pub fn with_builtins(prefix: impl Into<String>) -> Self {
        let mut reg = Self::new(prefix);
        reg.register(Arc::new(Ping));
        reg.register(Arc::new(Version));
        reg.register(Arc::new(Help));
        reg.register(Arc::new(Status));
        reg.register(Arc::new(AddQuote));
        reg.register(Arc::new(DeleteQuote));
        reg.register(Arc::new(AddGlobalQuote));
        reg.register(Arc::new(ListQuotes));
        reg.register(Arc::new(SetChannel));
        reg.register(Arc::new(Shutdown));
        reg.register(Arc::new(Restart));
        reg
    }

    pub fn register(&mut self, cmd: Arc<dyn Command>) {
        self.commands.insert(cmd.name(), cmd);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }

    pub fn is_command(&self, text: &str) -> bool {
        text.trim_start().starts_with(&self.prefix)
    }

    /// Splits `/name@bot args` into `("name", "args")`.
    pub fn parse<'a>(&self, text: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = text.trim().strip_prefix(self.prefix.as_str())?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or(head);
        if name.is_empty() {
            return None;
        }
        Some((name, args))
    }

    /// Runs the command in `msg`, if any. Returns whether it was a known command.
    pub async fn dispatch(&self, ctx: &BotContext, msg: &IncomingMessage) -> Result<bool> {
        let Some((name, args)) = self.parse(&msg.text) else {
            return Ok(false);
        };
        let lowered = name.to_lowercase();
        let Some(cmd) = self.commands.get(lowered.as_str()).cloned() else {
            return Ok(false);
        };

        if let Err(e) = check_permission(ctx, msg, cmd.permission()) {
            tracing::info!(command = cmd.name(), user = msg.author.0, "command refused");
            ctx.send_message_both(msg.chat_id, &refusal_text(&e)).await?;
            return Ok(true);
        }

        tracing::info!(command = cmd.name(), user = msg.author.0, chat = msg.chat_id.0, "running command");
        if lowered == "help" {
            let text = self.help_text(ctx, msg);
            ctx.send_message_both(msg.chat_id, &text).await?;
            return Ok(true);
        }
        cmd.execute(ctx, msg, args).await?;
        Ok(true)
    }

    fn help_text(&self, ctx: &BotContext, msg: &IncomingMessage) -> String {
        let mut lines = vec!["These are my commands:".to_string()];
        for cmd in self.commands.values() {
            if check_permission(ctx, msg, cmd.permission()).is_ok() {
                lines.push(format!("{}{} - {}", self.prefix, cmd.name(), cmd.help()));
            }
        }
        lines.join("\n")
    }
}

fn check_permission(ctx: &BotContext, msg: &IncomingMessage, perm: Permission) -> Result<()> {
    match perm {
        Permission::Anyone => Ok(()),
        Permission::Owner if ctx.config().is_owner(msg.author) => Ok(()),
        Permission::Owner => Err(Error::Permission("owner only".to_string())),
        Permission::GroupMember if !msg.is_private() => Ok(()),
        Permission::GroupMember => Err(Error::Permission("group chats only".to_string())),
    }
}

fn refusal_text(e: &Error) -> String {
    match e {
        Error::Permission(why) if why == "group chats only" => {
            "This command only works in group chats.".to_string()
        }
        _ => "You are not allowed to do that.".to_string(),
    }
}

/// Keyword and quote must not look like commands or formatting.
fn validate_quote(ctx: &BotContext, args: &str) -> std::result::Result<(String, String), &'static str> {
    let (keyword, text) = split_quote_args(args).ok_or("Keyword or quote text missing")?;
    let prefix = ctx.config().command_prefix.as_str();
    let bad_start = |s: &str| {
        s.starts_with(|c: char| c.is_ascii_punctuation()) || s.starts_with(prefix)
    };
    if bad_start(keyword.as_str()) || bad_start(text.as_str()) {
        return Err(
            "Neither the Keyword nor the quote text can start with punctuation to avoid running bot commands.",
        );
    }
    Ok((keyword, text))
}

/// `"two words" rest of text` or `word rest of text`.
pub fn split_quote_args(args: &str) -> Option<(String, String)> {
    let args = args.trim();
    let (keyword, text) = if let Some(rest) = args.strip_prefix('"') {
        let (k, t) = rest.split_once('"')?;
        (k.trim(), t.trim())
    } else {
        let (k, t) = args.split_once(char::is_whitespace)?;
        (k.trim(), t.trim())
    };
    if keyword.is_empty() || text.is_empty() {
        return None;
    }
    Some((keyword.to_string(), text.to_string()))
}

struct Ping;

#[async_trait]
impl Command for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }
    fn help(&self) -> &'static str {
        "Checks that I am awake."
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        ctx.send_message_both(msg.chat_id, "Pong!").await
    }
}

struct Version;

#[async_trait]
impl Command for Version {
    fn name(&self) -> &'static str {
        "version"
    }
    fn help(&self) -> &'static str {
        "Shows which version of me is running."
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        let text = format!("I am running version {}.", env!("CARGO_PKG_VERSION"));
        ctx.send_message_both(msg.chat_id, &text).await
    }
}

struct Help;

#[async_trait]
impl Command for Help {
    fn name(&self) -> &'static str {
        "help"
    }
    fn help(&self) -> &'static str {
        "Lists my commands."
    }
    // Rendered by the registry, which knows every command.
    async fn execute(&self, _ctx: &BotContext, _msg: &IncomingMessage, _args: &str) -> Result<()> {
        Ok(())
    }
}

struct Status;

#[async_trait]
impl Command for Status {
    fn name(&self) -> &'static str {
        "status"
    }
    fn help(&self) -> &'static str {
        "Sets my status line."
    }
    fn permission(&self) -> Permission {
        Permission::Owner
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, args: &str) -> Result<()> {
        if args.is_empty() {
            return ctx
                .send_message_both(msg.chat_id, "Tell me what the status should be.")
                .await;
        }
        ctx.set_status_text_both(args).await?;
        ctx.send_message_both(msg.chat_id, "Status updated.").await
    }
}

struct AddQuote;

#[async_trait]
impl Command for AddQuote {
    fn name(&self) -> &'static str {
        "addquote"
    }
    fn help(&self) -> &'static str {
        "Adds a quote for this chat: addquote \"key words\" reply text"
    }
    fn permission(&self) -> Permission {
        Permission::GroupMember
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, args: &str) -> Result<()> {
        let (keyword, text) = match validate_quote(ctx, args) {
            Ok(v) => v,
            Err(why) => return ctx.send_message_both(msg.chat_id, why).await,
        };
        let quote = Quote::new(QuoteScope::Chat(msg.chat_id), &keyword, text, Some(msg.author));
        let keyword = quote.keyword.clone();
        ctx.store().add_quote(quote).await?;
        tracing::info!(keyword = %keyword, chat = msg.chat_id.0, author = %msg.author_name, "quote added");
        ctx.send_message_both(msg.chat_id, "I saved the quote.").await
    }
}

struct DeleteQuote;

#[async_trait]
impl Command for DeleteQuote {
    fn name(&self) -> &'static str {
        "deletequote"
    }
    fn help(&self) -> &'static str {
        "Deletes a quote of this chat."
    }
    fn permission(&self) -> Permission {
        Permission::GroupMember
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, args: &str) -> Result<()> {
        let keyword = args.trim().trim_matches('"');
        if keyword.is_empty() {
            return ctx.send_message_both(msg.chat_id, "Which quote?").await;
        }
        let removed = ctx
            .store()
            .delete_quote(QuoteScope::Chat(msg.chat_id), keyword)
            .await?;
        let reply = if removed {
            "The quote was deleted."
        } else {
            "I could not find the quote."
        };
        ctx.send_message_both(msg.chat_id, reply).await
    }
}

struct AddGlobalQuote;

#[async_trait]
impl Command for AddGlobalQuote {
    fn name(&self) -> &'static str {
        "addglobalquote"
    }
    fn help(&self) -> &'static str {
        "Adds a quote that works in every chat."
    }
    fn permission(&self) -> Permission {
        Permission::Owner
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, args: &str) -> Result<()> {
        let (keyword, text) = match validate_quote(ctx, args) {
            Ok(v) => v,
            Err(why) => return ctx.send_message_both(msg.chat_id, why).await,
        };
        ctx.store()
            .add_quote(Quote::new(QuoteScope::Global, &keyword, text, Some(msg.author)))
            .await?;
        ctx.send_message_both(msg.chat_id, "I saved the quote.").await
    }
}

struct ListQuotes;

#[async_trait]
impl Command for ListQuotes {
    fn name(&self) -> &'static str {
        "listquotes"
    }
    fn help(&self) -> &'static str {
        "Lists the quotes of this chat."
    }
    fn permission(&self) -> Permission {
        Permission::GroupMember
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        let quotes = ctx.store().list_quotes(QuoteScope::Chat(msg.chat_id)).await?;
        if quotes.is_empty() {
            return ctx
                .send_message_both(msg.chat_id, "I couldn't find any quotes in this chat.")
                .await;
        }
        let keywords: Vec<&str> = quotes.iter().map(|q| q.keyword.as_str()).collect();
        ctx.send_message_both(msg.chat_id, &keywords.join("; ")).await
    }
}

struct SetChannel;

#[async_trait]
impl Command for SetChannel {
    fn name(&self) -> &'static str {
        "setchannel"
    }
    fn help(&self) -> &'static str {
        "Forwards my private messages from owners to this chat."
    }
    fn permission(&self) -> Permission {
        Permission::Owner
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        if msg.is_private() {
            return ctx
                .send_message_both(msg.chat_id, "This command only works in group chats.")
                .await;
        }
        ctx.set_main_chat(msg.chat_id);
        tracing::info!(chat = msg.chat_id.0, user = msg.author.0, "main chat changed");
        ctx.send_message_both(msg.chat_id, "Set the default channel to this channel.")
            .await
    }
}

struct Shutdown;

#[async_trait]
impl Command for Shutdown {
    fn name(&self) -> &'static str {
        "shutdown"
    }
    fn help(&self) -> &'static str {
        "Stops the bot."
    }
    fn permission(&self) -> Permission {
        Permission::Owner
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        tracing::warn!(user = msg.author.0, "shutdown requested");
        ctx.send_message_both(msg.chat_id, "Shutting down. Bye!").await?;
        ctx.request_exit(RunExit::Shutdown);
        Ok(())
    }
}

struct Restart;

#[async_trait]
impl Command for Restart {
    fn name(&self) -> &'static str {
        "restart"
    }
    fn help(&self) -> &'static str {
        "Restarts the bot."
    }
    fn permission(&self) -> Permission {
        Permission::Owner
    }
    async fn execute(&self, ctx: &BotContext, msg: &IncomingMessage, _args: &str) -> Result<()> {
        tracing::warn!(user = msg.author.0, "restart requested");
        ctx.send_message_both(msg.chat_id, "Restarting...").await?;
        ctx.request_exit(RunExit::Restart);
        Ok(())
    }
}
