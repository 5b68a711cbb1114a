use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{ConversationRecord, MessageRecord, MessageRole};
use super::{BoxFuture, ConversationStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: i64,
}

impl SqliteStorage {
    /// Connects to a file path, a `sqlite:` URL, or `:memory:`.
    ///
    /// The schema is not touched until [`ConversationStore::init`] runs.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One connection serializes writers and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite conversation store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-init-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&self.pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-init-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-init-migrate",
            })?;

        Ok(())
    }

    async fn upsert_conversation(&self, conversation: ConversationRecord) -> StorageResult<()> {
        let created_at = u64_to_i64(
            conversation.created_at_unix_millis,
            "conversation-put-created-at",
        )?;
        let updated_at = u64_to_i64(
            conversation.updated_at_unix_millis,
            "conversation-put-updated-at",
        )?;

        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
        )
        .bind(conversation.id.to_string())
        .bind(conversation.title)
        .bind(created_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-put",
        })?;

        Ok(())
    }

    async fn select_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, created_at, updated_at FROM conversations \
             ORDER BY updated_at DESC, created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-list-query",
        })?;

        rows.into_iter().map(conversation_row_to_record).collect()
    }

    async fn overwrite_messages(
        &self,
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-replace-begin",
        })?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
            .bind(conversation_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-replace-conversation-exists",
            })?;
        if exists.is_none() {
            return NotFoundSnafu {
                stage: "message-replace-missing-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-replace-delete",
            })?;

        for (position, message) in messages.into_iter().enumerate() {
            let created_at = u64_to_i64(message.created_at_unix_millis, "message-replace-created-at")?;
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, position, role, content, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id.to_string())
            .bind(conversation_id.to_string())
            .bind(position as i64)
            .bind(message.role.as_str())
            .bind(message.content)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-replace-insert",
            })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-replace-commit",
        })?;

        Ok(())
    }

    async fn select_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, role, content, created_at FROM messages WHERE conversation_id = ? \
             ORDER BY created_at ASC, position ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn remove_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "conversation-delete-begin",
        })?;

        // Messages go first so the unit stays valid even without cascading foreign keys.
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-delete-messages",
            })?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-delete-row",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "conversation-delete-commit",
        })?;

        Ok(())
    }

    async fn remove_everything(&self) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "store-clear-begin",
        })?;
        sqlx::query("DELETE FROM messages")
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "store-clear-messages",
            })?;
        sqlx::query("DELETE FROM conversations")
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "store-clear-conversations",
            })?;
        tx.commit().await.context(SqliteQuerySnafu {
            stage: "store-clear-commit",
        })?;

        Ok(())
    }
}

impl ConversationStore for SqliteStorage {
    fn init(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.init_schema())
    }

    fn put_conversation(&self, conversation: ConversationRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.upsert_conversation(conversation))
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(self.select_conversations())
    }

    fn replace_messages(
        &self,
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.overwrite_messages(conversation_id, messages))
    }

    fn get_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.select_messages(conversation_id))
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.remove_conversation(conversation_id))
    }

    fn clear(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.remove_everything())
    }
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStorage {
        let store = SqliteStorage::open(":memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    async fn count_messages(store: &SqliteStorage, conversation_id: ConversationId) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = memory_store().await;
        store.init().await.unwrap();
        assert!(store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversations_list_newest_update_first() {
        let store = memory_store().await;
        let older = ConversationRecord::new("older", 1_000);
        let newer = ConversationRecord::new("newer", 2_000);
        store.put_conversation(older.clone()).await.unwrap();
        store.put_conversation(newer.clone()).await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed, vec![newer, older.clone()]);

        let mut bumped = older.clone();
        bumped.updated_at_unix_millis = 3_000;
        bumped.title = "renamed".to_string();
        store.put_conversation(bumped.clone()).await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0], bumped);
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn messages_come_back_in_creation_order_with_ties_kept_in_insertion_order() {
        let store = memory_store().await;
        let conversation = ConversationRecord::new("chat", 10);
        store.put_conversation(conversation.clone()).await.unwrap();

        let messages = vec![
            MessageRecord::user("first", 100),
            MessageRecord::assistant_placeholder(100),
            MessageRecord::user("third", 100),
            MessageRecord::user("fourth", 250),
        ];
        store
            .replace_messages(conversation.id, messages.clone())
            .await
            .unwrap();

        assert_eq!(store.get_messages(conversation.id).await.unwrap(), messages);
    }

    #[tokio::test]
    async fn replace_overwrites_the_previous_list() {
        let store = memory_store().await;
        let conversation = ConversationRecord::new("chat", 10);
        store.put_conversation(conversation.clone()).await.unwrap();

        let first = MessageRecord::user("hello", 100);
        store
            .replace_messages(conversation.id, vec![first.clone()])
            .await
            .unwrap();

        let mut reply = MessageRecord::assistant_placeholder(101);
        reply.content = "Hi".to_string();
        store
            .replace_messages(conversation.id, vec![first.clone(), reply.clone()])
            .await
            .unwrap();

        assert_eq!(
            store.get_messages(conversation.id).await.unwrap(),
            vec![first, reply]
        );

        store.replace_messages(conversation.id, Vec::new()).await.unwrap();
        assert!(store.get_messages(conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replacing_messages_of_a_missing_conversation_fails() {
        let store = memory_store().await;
        let missing = ConversationId::new_v7();
        let error = store
            .replace_messages(missing, vec![MessageRecord::user("lost", 1)])
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::NotFound { .. }));
        assert_eq!(count_messages(&store, missing).await, 0);
    }

    #[tokio::test]
    async fn deleting_a_conversation_leaves_no_orphan_messages() {
        let store = memory_store().await;
        let doomed = ConversationRecord::new("doomed", 10);
        let kept = ConversationRecord::new("kept", 20);
        store.put_conversation(doomed.clone()).await.unwrap();
        store.put_conversation(kept.clone()).await.unwrap();
        store
            .replace_messages(
                doomed.id,
                vec![MessageRecord::user("a", 1), MessageRecord::user("b", 2)],
            )
            .await
            .unwrap();
        store
            .replace_messages(kept.id, vec![MessageRecord::user("c", 3)])
            .await
            .unwrap();

        store.delete_conversation(doomed.id).await.unwrap();

        assert_eq!(count_messages(&store, doomed.id).await, 0);
        assert_eq!(count_messages(&store, kept.id).await, 1);
        assert_eq!(store.list_conversations().await.unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn clear_removes_every_row() {
        let store = memory_store().await;
        let conversation = ConversationRecord::new("chat", 10);
        store.put_conversation(conversation.clone()).await.unwrap();
        store
            .replace_messages(conversation.id, vec![MessageRecord::user("a", 1)])
            .await
            .unwrap();

        store.clear().await.unwrap();

        assert!(store.list_conversations().await.unwrap().is_empty());
        assert_eq!(count_messages(&store, conversation.id).await, 0);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.db");
        let location = path.display().to_string();

        let conversation = ConversationRecord::new("persisted", 10);
        let messages = vec![
            MessageRecord::user("hello", 11),
            MessageRecord::assistant_placeholder(11),
        ];
        {
            let store = SqliteStorage::open(&location).await.unwrap();
            store.init().await.unwrap();
            store.put_conversation(conversation.clone()).await.unwrap();
            store
                .replace_messages(conversation.id, messages.clone())
                .await
                .unwrap();
            store.pool().close().await;
        }

        let reopened = SqliteStorage::open(&location).await.unwrap();
        reopened.init().await.unwrap();
        assert_eq!(reopened.list_conversations().await.unwrap(), vec![conversation.clone()]);
        assert_eq!(reopened.get_messages(conversation.id).await.unwrap(), messages);
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("data/chat.db"), "sqlite://data/chat.db");
    }
}
