use crate::domain::{ChatId, MessageId, UserId};

/// Relay-side incoming update model.
///
/// Telegram-specific fields stay in the Telegram adapter.
#[derive(Clone, Debug)]
pub enum IncomingUpdate {
    Command(Command),
    Content(ContentMessage),
}

impl IncomingUpdate {
    pub fn chat_id(&self) -> ChatId {
        match self {
            IncomingUpdate::Command(c) => c.chat_id,
            IncomingUpdate::Content(c) => c.chat_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: UserId,
    /// Lowercased, without the leading `/` and any `@botname` suffix.
    pub name: String,
    pub args: String,
}

/// A content-bearing (non-command) message from an operator.
#[derive(Clone, Debug)]
pub struct ContentMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    /// The relayed message this one replies to, if any.
    pub reply_to: Option<MessageId>,
    pub body: ContentBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentBody {
    Text(String),
    Photo {
        /// Largest available size.
        file_id: String,
        caption: Option<String>,
    },
    Document {
        file_id: String,
        file_name: Option<String>,
        mime_type: Option<String>,
        caption: Option<String>,
    },
    /// Stickers, voice notes, locations...
    Unsupported { kind: String },
}

/// Capabilities / limits of a relay implementation.
#[derive(Clone, Copy, Debug)]
pub struct RelayCapabilities {
    pub max_message_len: usize,
    pub max_caption_len: usize,
}
