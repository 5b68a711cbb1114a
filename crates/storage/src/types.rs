use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::{ConversationId, MessageId};

/// Title given to conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

/// Storage-local message role, decoupled from engine-side role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

impl ConversationRecord {
    /// Creates a fresh record stamped with `now` for both timestamps.
    pub fn new(title: impl Into<String>, now_unix_millis: u64) -> Self {
        Self {
            id: ConversationId::new_v7(),
            title: title.into(),
            created_at_unix_millis: now_unix_millis,
            updated_at_unix_millis: now_unix_millis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_millis: u64,
}

impl MessageRecord {
    pub fn new(role: MessageRole, content: impl Into<String>, created_at_unix_millis: u64) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            created_at_unix_millis,
        }
    }

    pub fn user(content: impl Into<String>, created_at_unix_millis: u64) -> Self {
        Self::new(MessageRole::User, content, created_at_unix_millis)
    }

    /// Empty assistant message that streaming output is merged into.
    pub fn assistant_placeholder(created_at_unix_millis: u64) -> Self {
        Self::new(MessageRole::Assistant, String::new(), created_at_unix_millis)
    }
}

/// Orders messages by creation time; the stable sort keeps insertion order for ties.
pub fn sort_messages_chronologically(messages: &mut [MessageRecord]) {
    messages.sort_by_key(|message| message.created_at_unix_millis);
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
