use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole,
    sort_messages_chronologically, unix_timestamp_millis,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable home of conversations and their messages.
///
/// This is the only component allowed to touch persistent state. Every write is
/// atomic: a message list is replaced as a whole, and deleting a conversation
/// takes its messages with it in the same transaction.
pub trait ConversationStore: Send + Sync {
    /// Prepares the backend. Safe to call more than once.
    fn init(&self) -> BoxFuture<'_, StorageResult<()>>;

    /// Inserts or overwrites one conversation row.
    fn put_conversation(&self, conversation: ConversationRecord) -> BoxFuture<'_, StorageResult<()>>;

    /// Conversations by `updated_at` descending, newest creation first on ties.
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;

    /// Replaces the full message list of an existing conversation.
    fn replace_messages(
        &self,
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>>;

    /// Messages by `created_at` ascending, insertion order on ties.
    fn get_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    /// Removes a conversation row and all of its messages as one unit.
    fn delete_conversation(&self, conversation_id: ConversationId)
    -> BoxFuture<'_, StorageResult<()>>;

    /// Removes every conversation and message.
    fn clear(&self) -> BoxFuture<'_, StorageResult<()>>;
}
