/// Chat platform user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UserId(pub i64);

/// Chat id (numeric). Group chats and direct messages share the id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChatId(pub i64);

/// Message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Who the connected bot account is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

/// A message delivered by the chat client.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub message_id: MessageId,
    pub author: UserId,
    pub author_name: String,
    pub author_is_bot: bool,
    pub text: String,
    /// Usernames mentioned in the message, without the leading `@`.
    pub mentions: Vec<String>,
}

impl IncomingMessage {
    pub fn mentions(&self, username: &str) -> bool {
        self.mentions
            .iter()
            .any(|m| m.eq_ignore_ascii_case(username))
    }

    pub fn is_private(&self) -> bool {
        self.chat_kind == ChatKind::Private
    }

    #[cfg(test)]
    pub(crate) fn sample(chat: i64, author: i64, text: &str) -> Self {
        Self {
            chat_id: ChatId(chat),
            chat_kind: if chat == author {
                ChatKind::Private
            } else {
                ChatKind::Group
            },
            message_id: MessageId(1),
            author: UserId(author),
            author_name: format!("user{author}"),
            author_is_bot: false,
            text: text.to_string(),
            mentions: text
                .split_whitespace()
                .filter_map(|w| w.strip_prefix('@'))
                .map(str::to_string)
                .collect(),
        }
    }
}

/// A reaction added to a message.
#[derive(Clone, Debug)]
pub struct ReactionAdded {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user: UserId,
    pub emoji: String,
}
