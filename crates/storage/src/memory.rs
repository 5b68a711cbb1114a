use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use snafu::ensure;

use super::error::{NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::ids::ConversationId;
use super::types::{ConversationRecord, MessageRecord, sort_messages_chronologically};
use super::{BoxFuture, ConversationStore};

#[derive(Debug, Default)]
struct MemoryTables {
    conversations: Vec<ConversationRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
}

/// Process-local store with the same contract as the SQLite backend.
///
/// Writes can be made to fail on demand, which lets callers exercise their
/// storage-fault paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<MemoryTables>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, enabled: bool) {
        self.fail_reads.store(enabled, Ordering::SeqCst);
    }

    /// Number of message rows across all conversations.
    pub fn message_row_count(&self) -> usize {
        self.lock().messages.values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTables> {
        // A poisoned lock only means a test panicked mid-write; the tables stay usable.
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_write(&self, stage: &'static str) -> StorageResult<()> {
        ensure!(
            !self.fail_writes.load(Ordering::SeqCst),
            UnavailableSnafu {
                stage,
                details: "memory store writes are disabled".to_string(),
            }
        );
        Ok(())
    }

    fn check_read(&self, stage: &'static str) -> StorageResult<()> {
        ensure!(
            !self.fail_reads.load(Ordering::SeqCst),
            UnavailableSnafu {
                stage,
                details: "memory store reads are disabled".to_string(),
            }
        );
        Ok(())
    }
}

impl ConversationStore for MemoryStorage {
    fn init(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move { self.check_read("memory-init") })
    }

    fn put_conversation(&self, conversation: ConversationRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_write("memory-conversation-put")?;
            let mut tables = self.lock();
            match tables
                .conversations
                .iter_mut()
                .find(|existing| existing.id == conversation.id)
            {
                Some(existing) => {
                    existing.title = conversation.title;
                    existing.updated_at_unix_millis = conversation.updated_at_unix_millis;
                }
                None => tables.conversations.push(conversation),
            }
            Ok(())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            self.check_read("memory-conversation-list")?;
            let tables = self.lock();
            // Reverse insertion order first so the stable sort puts later inserts ahead on ties.
            let mut conversations = tables.conversations.iter().rev().cloned().collect::<Vec<_>>();
            conversations.sort_by(|left, right| {
                right
                    .updated_at_unix_millis
                    .cmp(&left.updated_at_unix_millis)
                    .then_with(|| right.created_at_unix_millis.cmp(&left.created_at_unix_millis))
            });
            Ok(conversations)
        })
    }

    fn replace_messages(
        &self,
        conversation_id: ConversationId,
        mut messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_write("memory-message-replace")?;
            let mut tables = self.lock();
            ensure!(
                tables
                    .conversations
                    .iter()
                    .any(|conversation| conversation.id == conversation_id),
                NotFoundSnafu {
                    stage: "memory-message-replace-missing-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );
            sort_messages_chronologically(&mut messages);
            tables.messages.insert(conversation_id, messages);
            Ok(())
        })
    }

    fn get_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.check_read("memory-message-list")?;
            Ok(self
                .lock()
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_write("memory-conversation-delete")?;
            let mut tables = self.lock();
            tables
                .conversations
                .retain(|conversation| conversation.id != conversation_id);
            tables.messages.remove(&conversation_id);
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_write("memory-clear")?;
            let mut tables = self.lock();
            tables.conversations.clear();
            tables.messages.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[tokio::test]
    async fn mirrors_sqlite_ordering_rules() {
        let store = MemoryStorage::new();
        let first = ConversationRecord::new("first", 500);
        let second = ConversationRecord::new("second", 500);
        store.put_conversation(first.clone()).await.unwrap();
        store.put_conversation(second.clone()).await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed, vec![second, first.clone()]);

        let messages = vec![
            MessageRecord::user("late", 20),
            MessageRecord::user("tie-a", 10),
            MessageRecord::user("tie-b", 10),
        ];
        store.replace_messages(first.id, messages).await.unwrap();
        let contents = store
            .get_messages(first.id)
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn delete_takes_messages_with_it() {
        let store = MemoryStorage::new();
        let conversation = ConversationRecord::new("chat", 1);
        store.put_conversation(conversation.clone()).await.unwrap();
        store
            .replace_messages(conversation.id, vec![MessageRecord::user("a", 2)])
            .await
            .unwrap();

        store.delete_conversation(conversation.id).await.unwrap();

        assert_eq!(store.message_row_count(), 0);
        assert!(store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_write_faults_leave_data_untouched() {
        let store = MemoryStorage::new();
        let conversation = ConversationRecord::new("chat", 1);
        store.put_conversation(conversation.clone()).await.unwrap();

        store.fail_writes(true);
        let error = store.delete_conversation(conversation.id).await.unwrap_err();
        assert!(matches!(error, StorageError::Unavailable { .. }));

        store.fail_writes(false);
        assert_eq!(store.list_conversations().await.unwrap(), vec![conversation]);
    }
}
