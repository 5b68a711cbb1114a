use std::sync::Arc;

use parley_storage::{
    ConversationId, ConversationRecord, ConversationStore, MessageRecord, StorageError,
    StorageResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistJob {
    PutConversation(ConversationRecord),
    ReplaceMessages {
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    },
    DeleteConversation(ConversationId),
    Clear,
}

impl PersistJob {
    fn kind(&self) -> &'static str {
        match self {
            Self::PutConversation(_) => "put-conversation",
            Self::ReplaceMessages { .. } => "replace-messages",
            Self::DeleteConversation(_) => "delete-conversation",
            Self::Clear => "clear",
        }
    }

    fn replaced_conversation(&self) -> Option<ConversationId> {
        match self {
            Self::ReplaceMessages {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }
}

enum QueueItem {
    Job {
        job: PersistJob,
        reply: Option<oneshot::Sender<StorageResult<()>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Single in-flight writer in front of the store.
///
/// Jobs run strictly in submission order. Unacknowledged full replaces that are
/// superseded by a newer queued replace of the same conversation are skipped.
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    writer: JoinHandle<()>,
}

impl PersistQueue {
    /// Spawns the writer task on the current runtime.
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(store, rx));
        Self { tx, writer }
    }

    /// Queues a write whose outcome is only logged.
    pub fn submit(&self, job: PersistJob) {
        if self.tx.send(QueueItem::Job { job, reply: None }).is_err() {
            tracing::error!("persist queue writer is gone, dropping job");
        }
    }

    /// Queues a write behind everything already submitted and waits for its result.
    pub async fn execute(&self, job: PersistJob) -> StorageResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::Job {
                job,
                reply: Some(reply_tx),
            })
            .map_err(|_| writer_gone("persist-execute-send"))?;
        reply_rx
            .await
            .map_err(|_| writer_gone("persist-execute-reply"))?
    }

    /// Resolves once every job submitted before this call has completed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drains the queue and stops the writer.
    pub async fn shutdown(self) {
        let Self { tx, writer } = self;
        drop(tx);
        if let Err(error) = writer.await {
            tracing::error!(error = %error, "persist queue writer panicked");
        }
    }
}

fn writer_gone(stage: &'static str) -> StorageError {
    StorageError::Unavailable {
        stage,
        details: "persist queue writer stopped".to_string(),
    }
}

async fn run_writer(
    store: Arc<dyn ConversationStore>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(item) = rx.try_recv() {
            batch.push(item);
        }

        let superseded = superseded_replaces(&batch);
        for (index, item) in batch.into_iter().enumerate() {
            match item {
                QueueItem::Flush(done) => {
                    let _ = done.send(());
                }
                QueueItem::Job { job, reply: None } if superseded[index] => {
                    tracing::trace!(job = job.kind(), "skipping superseded write");
                }
                QueueItem::Job { job, reply } => {
                    let kind = job.kind();
                    let result = apply_job(store.as_ref(), job).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(error) = result {
                                tracing::warn!(job = kind, error = %error, "background write failed");
                            }
                        }
                    }
                }
            }
        }
    }

    tracing::debug!("persist queue writer stopped");
}

fn superseded_replaces(batch: &[QueueItem]) -> Vec<bool> {
    let mut superseded = vec![false; batch.len()];
    for (index, item) in batch.iter().enumerate() {
        let QueueItem::Job { job, reply: None } = item else {
            continue;
        };
        let Some(conversation_id) = job.replaced_conversation() else {
            continue;
        };
        superseded[index] = batch[index + 1..].iter().any(|later| {
            matches!(later, QueueItem::Job { job, .. } if job.replaced_conversation() == Some(conversation_id))
        });
    }
    superseded
}

async fn apply_job(store: &dyn ConversationStore, job: PersistJob) -> StorageResult<()> {
    match job {
        PersistJob::PutConversation(record) => store.put_conversation(record).await,
        PersistJob::ReplaceMessages {
            conversation_id,
            messages,
        } => store.replace_messages(conversation_id, messages).await,
        PersistJob::DeleteConversation(conversation_id) => {
            store.delete_conversation(conversation_id).await
        }
        PersistJob::Clear => store.clear().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use parley_storage::{BoxFuture, MemoryStorage};

    use super::*;

    /// Records every replace that reaches the backend.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStorage,
        replaced: Mutex<Vec<Vec<String>>>,
    }

    impl ConversationStore for RecordingStore {
        fn init(&self) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.init()
        }

        fn put_conversation(
            &self,
            conversation: ConversationRecord,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.put_conversation(conversation)
        }

        fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
            self.inner.list_conversations()
        }

        fn replace_messages(
            &self,
            conversation_id: ConversationId,
            messages: Vec<MessageRecord>,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.replaced.lock().unwrap().push(
                messages
                    .iter()
                    .map(|message| message.content.clone())
                    .collect(),
            );
            self.inner.replace_messages(conversation_id, messages)
        }

        fn get_messages(
            &self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
            self.inner.get_messages(conversation_id)
        }

        fn delete_conversation(
            &self,
            conversation_id: ConversationId,
        ) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.delete_conversation(conversation_id)
        }

        fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.clear()
        }
    }

    fn replace(conversation_id: ConversationId, content: &str) -> PersistJob {
        PersistJob::ReplaceMessages {
            conversation_id,
            messages: vec![MessageRecord::user(content, 1)],
        }
    }

    #[tokio::test]
    async fn queued_replaces_collapse_to_the_newest() {
        let store = Arc::new(RecordingStore::default());
        let queue = PersistQueue::new(store.clone());
        let conversation = ConversationRecord::new("chat", 1);
        queue
            .execute(PersistJob::PutConversation(conversation.clone()))
            .await
            .unwrap();

        queue.submit(replace(conversation.id, "H"));
        queue.submit(replace(conversation.id, "Hi"));
        queue.submit(replace(conversation.id, "Hi!"));
        queue.flush().await;

        assert_eq!(*store.replaced.lock().unwrap(), vec![vec!["Hi!".to_string()]]);
        let stored = store.get_messages(conversation.id).await.unwrap();
        assert_eq!(stored[0].content, "Hi!");
    }

    #[tokio::test]
    async fn delete_is_never_overtaken_by_an_earlier_replace() {
        let store = Arc::new(MemoryStorage::new());
        let queue = PersistQueue::new(store.clone());
        let conversation = ConversationRecord::new("chat", 1);
        queue
            .execute(PersistJob::PutConversation(conversation.clone()))
            .await
            .unwrap();

        queue.submit(replace(conversation.id, "partial"));
        queue
            .execute(PersistJob::DeleteConversation(conversation.id))
            .await
            .unwrap();
        queue.submit(replace(conversation.id, "late delta"));
        queue.flush().await;

        assert_eq!(store.message_row_count(), 0);
        assert!(store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_reports_store_failures() {
        let store = Arc::new(MemoryStorage::new());
        let queue = PersistQueue::new(store.clone());
        store.fail_writes(true);

        let error = queue
            .execute(PersistJob::PutConversation(ConversationRecord::new("x", 1)))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Unavailable { .. }));

        queue.shutdown().await;
    }
}
