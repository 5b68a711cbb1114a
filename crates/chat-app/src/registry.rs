use parley_storage::{ConversationId, ConversationRecord, DEFAULT_CONVERSATION_TITLE};
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{ChatResult, StoreSnafu, UnknownConversationSnafu, ValidationSnafu};
use crate::persist::{PersistJob, PersistQueue};

#[derive(Debug, Clone)]
struct RegistryEntry {
    record: ConversationRecord,
    sequence: u64,
}

/// In-memory index of conversations, newest activity first.
///
/// Entries with the same `updated_at` keep the order of their `create` calls,
/// most recent first.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    entries: Vec<RegistryEntry>,
    next_sequence: u64,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the index with rows already ordered by the store.
    pub fn load(&mut self, records: Vec<ConversationRecord>) {
        let count = records.len() as u64;
        self.entries = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| RegistryEntry {
                record,
                sequence: count - index as u64,
            })
            .collect();
        self.next_sequence = count + 1;
        self.sort();
    }

    pub fn list(&self) -> Vec<ConversationRecord> {
        self.entries.iter().map(|entry| entry.record.clone()).collect()
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationRecord> {
        self.entries
            .iter()
            .find(|entry| entry.record.id == id)
            .map(|entry| &entry.record)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn most_recent(&self) -> Option<&ConversationRecord> {
        self.entries.first().map(|entry| &entry.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub async fn create(
        &mut self,
        queue: &PersistQueue,
        title: &str,
        now_unix_millis: u64,
    ) -> ChatResult<ConversationRecord> {
        let title = match title.trim() {
            "" => DEFAULT_CONVERSATION_TITLE,
            trimmed => trimmed,
        };
        let record = ConversationRecord::new(title, now_unix_millis);

        queue
            .execute(PersistJob::PutConversation(record.clone()))
            .await
            .context(StoreSnafu {
                stage: "registry-create",
            })?;

        self.next_sequence += 1;
        self.entries.push(RegistryEntry {
            record: record.clone(),
            sequence: self.next_sequence,
        });
        self.sort();
        tracing::debug!(conversation_id = %record.id, "created conversation");
        Ok(record)
    }

    pub async fn rename(
        &mut self,
        queue: &PersistQueue,
        id: ConversationId,
        title: &str,
        now_unix_millis: u64,
    ) -> ChatResult<()> {
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            ValidationSnafu {
                stage: "registry-rename",
                details: "title is empty".to_string(),
            }
        );

        let mut record = self
            .get(id)
            .cloned()
            .context(UnknownConversationSnafu {
                stage: "registry-rename",
                id: id.to_string(),
            })?;
        record.title = title.to_string();
        record.updated_at_unix_millis = record.updated_at_unix_millis.max(now_unix_millis);

        queue
            .execute(PersistJob::PutConversation(record.clone()))
            .await
            .context(StoreSnafu {
                stage: "registry-rename",
            })?;

        self.replace_record(record);
        Ok(())
    }

    /// Durably deletes the conversation, then drops it from the index.
    pub async fn remove(&mut self, queue: &PersistQueue, id: ConversationId) -> ChatResult<()> {
        queue
            .execute(PersistJob::DeleteConversation(id))
            .await
            .context(StoreSnafu {
                stage: "registry-remove",
            })?;

        self.entries.retain(|entry| entry.record.id != id);
        Ok(())
    }

    /// Moves `updated_at` forward to `at` and queues the new row.
    ///
    /// Returns false when the conversation is not indexed.
    pub fn touch(&mut self, queue: &PersistQueue, id: ConversationId, at: u64) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.record.id == id) else {
            return false;
        };

        entry.record.updated_at_unix_millis = entry.record.updated_at_unix_millis.max(at);
        queue.submit(PersistJob::PutConversation(entry.record.clone()));
        self.sort();
        true
    }

    fn replace_record(&mut self, record: ConversationRecord) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.record.id == record.id)
        {
            entry.record = record;
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.entries.sort_by(|left, right| {
            right
                .record
                .updated_at_unix_millis
                .cmp(&left.record.updated_at_unix_millis)
                .then_with(|| right.sequence.cmp(&left.sequence))
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_storage::{ConversationStore, MemoryStorage};

    use super::*;
    use crate::error::ChatError;

    fn setup() -> (Arc<MemoryStorage>, PersistQueue, ConversationRegistry) {
        let store = Arc::new(MemoryStorage::new());
        let queue = PersistQueue::new(store.clone());
        (store, queue, ConversationRegistry::new())
    }

    fn is_sorted(registry: &ConversationRegistry) -> bool {
        registry
            .list()
            .windows(2)
            .all(|pair| pair[0].updated_at_unix_millis >= pair[1].updated_at_unix_millis)
    }

    #[tokio::test]
    async fn create_defaults_the_title_and_prepends() {
        let (store, queue, mut registry) = setup();
        let first = registry.create(&queue, "", 10).await.unwrap();
        let second = registry.create(&queue, "  Trip plans ", 10).await.unwrap();

        assert_eq!(first.title, "New Chat");
        assert_eq!(second.title, "Trip plans");
        let ids = registry.list().into_iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(store.list_conversations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stays_sorted_through_touch_and_remove() {
        let (_store, queue, mut registry) = setup();
        let a = registry.create(&queue, "a", 1).await.unwrap();
        let b = registry.create(&queue, "b", 2).await.unwrap();
        let c = registry.create(&queue, "c", 3).await.unwrap();
        assert!(is_sorted(&registry));

        assert!(registry.touch(&queue, a.id, 9));
        assert_eq!(registry.most_recent().map(|r| r.id), Some(a.id));
        assert!(registry.touch(&queue, a.id, 4));
        assert_eq!(registry.get(a.id).unwrap().updated_at_unix_millis, 9);
        assert!(!registry.touch(&queue, ConversationId::new_v7(), 4));

        registry.remove(&queue, a.id).await.unwrap();
        assert!(is_sorted(&registry));
        assert_eq!(registry.most_recent().map(|r| r.id), Some(c.id));
        assert!(registry.contains(b.id));
        assert!(!registry.contains(a.id));
    }

    #[tokio::test]
    async fn rename_rejects_blank_titles_and_bumps_updated_at() {
        let (store, queue, mut registry) = setup();
        let record = registry.create(&queue, "old", 5).await.unwrap();

        let error = registry.rename(&queue, record.id, "   ", 6).await.unwrap_err();
        assert!(matches!(error, ChatError::Validation { .. }));
        assert_eq!(registry.get(record.id).unwrap().title, "old");

        registry.rename(&queue, record.id, "new", 7).await.unwrap();
        let stored = store.list_conversations().await.unwrap();
        assert_eq!(stored[0].title, "new");
        assert_eq!(stored[0].updated_at_unix_millis, 7);
    }

    #[tokio::test]
    async fn failed_create_leaves_the_index_alone() {
        let (store, queue, mut registry) = setup();
        store.fail_writes(true);

        let error = registry.create(&queue, "x", 1).await.unwrap_err();
        assert!(matches!(error, ChatError::Store { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn load_keeps_store_order_for_ties() {
        let mut registry = ConversationRegistry::new();
        let newer = ConversationRecord::new("newer", 100);
        let older = ConversationRecord::new("older", 100);
        registry.load(vec![newer.clone(), older.clone()]);
        assert_eq!(registry.list(), vec![newer, older]);
    }
}
