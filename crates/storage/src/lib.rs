use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ConversationKey, MessageId, UserId};

/// Persisted row shape. Structured fields are kept as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub attachment_json: Option<String>,
    pub reactions_json: String,
    pub reply_to_json: Option<String>,
    pub edited: bool,
    pub unsent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredMessagePatch {
    pub content: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub attachment_json: Option<String>,
    pub reactions_json: Option<String>,
    pub edited: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// The row now lives under the new id.
    Renamed,
    /// A row with the new id already existed; the old row was dropped and the new one patched.
    Merged,
    /// No row with the old id.
    Missing,
}

/// Durable message cache keyed by id, range-readable per conversation.
///
/// `patch`, `rename_id` and `delete` treat a missing row as a no-op and report it
/// through their return value instead of failing.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn load(&self, conversation_key: &ConversationKey) -> Result<Vec<StoredMessage>>;
    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>>;
    async fn upsert(&self, message: &StoredMessage) -> Result<()>;
    async fn upsert_many(&self, messages: &[StoredMessage]) -> Result<()>;
    async fn patch(&self, id: &MessageId, patch: &StoredMessagePatch) -> Result<bool>;
    async fn rename_id(
        &self,
        old_id: &MessageId,
        new_id: &MessageId,
        patch: &StoredMessagePatch,
    ) -> Result<RenameOutcome>;
    async fn delete(&self, id: &MessageId) -> Result<bool>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const SELECT_COLUMNS: &str = "SELECT id, sender_id, recipient_id, content, kind, status, created_at_ms, attachment_json, reactions_json, reply_to_json, edited, unsent FROM messages";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open message cache at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn count_messages(&self, conversation_key: &ConversationKey) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_key = ?")
                .bind(conversation_key.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

async fn upsert_row<'e, E>(executor: E, message: &StoredMessage) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO messages (id, conversation_key, sender_id, recipient_id, content, kind, status, created_at_ms, attachment_json, reactions_json, reply_to_json, edited, unsent)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            conversation_key = excluded.conversation_key,
            sender_id = excluded.sender_id,
            recipient_id = excluded.recipient_id,
            content = excluded.content,
            kind = excluded.kind,
            status = excluded.status,
            created_at_ms = excluded.created_at_ms,
            attachment_json = excluded.attachment_json,
            reactions_json = excluded.reactions_json,
            reply_to_json = excluded.reply_to_json,
            edited = excluded.edited,
            unsent = excluded.unsent",
    )
    .bind(message.id.as_str())
    .bind(message.conversation_key.as_str())
    .bind(&message.sender_id)
    .bind(&message.recipient_id)
    .bind(&message.content)
    .bind(&message.kind)
    .bind(&message.status)
    .bind(message.created_at.timestamp_millis())
    .bind(message.attachment_json.as_deref())
    .bind(&message.reactions_json)
    .bind(message.reply_to_json.as_deref())
    .bind(message.edited)
    .bind(message.unsent)
    .execute(executor)
    .await
    .with_context(|| format!("failed to upsert message {}", message.id))?;
    Ok(())
}

async fn patch_row<'e, E>(executor: E, id: &MessageId, patch: &StoredMessagePatch) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE messages SET
            content = COALESCE(?, content),
            status = COALESCE(?, status),
            created_at_ms = COALESCE(?, created_at_ms),
            attachment_json = COALESCE(?, attachment_json),
            reactions_json = COALESCE(?, reactions_json),
            edited = COALESCE(?, edited)
         WHERE id = ?",
    )
    .bind(patch.content.as_deref())
    .bind(patch.status.as_deref())
    .bind(patch.created_at.map(|at| at.timestamp_millis()))
    .bind(patch.attachment_json.as_deref())
    .bind(patch.reactions_json.as_deref())
    .bind(patch.edited)
    .bind(id.as_str())
    .execute(executor)
    .await
    .with_context(|| format!("failed to patch message {id}"))?;
    Ok(result.rows_affected() > 0)
}

fn row_to_message(row: SqliteRow) -> Result<StoredMessage> {
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_at_ms)
        .with_context(|| format!("invalid created_at_ms {created_at_ms}"))?;
    let sender_id: String = row.try_get("sender_id")?;
    let recipient_id: String = row.try_get("recipient_id")?;
    Ok(StoredMessage {
        id: MessageId(row.try_get("id")?),
        conversation_key: ConversationKey::between(
            &UserId(sender_id.clone()),
            &UserId(recipient_id.clone()),
        ),
        sender_id,
        recipient_id,
        content: row.try_get("content")?,
        kind: row.try_get("kind")?,
        status: row.try_get("status")?,
        created_at,
        attachment_json: row.try_get("attachment_json")?,
        reactions_json: row.try_get("reactions_json")?,
        reply_to_json: row.try_get("reply_to_json")?,
        edited: row.try_get("edited")?,
        unsent: row.try_get("unsent")?,
    })
}

#[async_trait]
impl MessageStore for Storage {
    async fn load(&self, conversation_key: &ConversationKey) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE conversation_key = ? ORDER BY created_at_ms ASC, rowid ASC"
        ))
        .bind(conversation_key.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load conversation {conversation_key}"))?;

        rows.into_iter().map(row_to_message).collect()
    }

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_message).transpose()
    }

    async fn upsert(&self, message: &StoredMessage) -> Result<()> {
        upsert_row(&self.pool, message).await
    }

    async fn upsert_many(&self, messages: &[StoredMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            upsert_row(&mut *tx, message).await?;
        }
        tx.commit().await.context("failed to commit bulk upsert")?;
        Ok(())
    }

    async fn patch(&self, id: &MessageId, patch: &StoredMessagePatch) -> Result<bool> {
        patch_row(&self.pool, id, patch).await
    }

    async fn rename_id(
        &self,
        old_id: &MessageId,
        new_id: &MessageId,
        patch: &StoredMessagePatch,
    ) -> Result<RenameOutcome> {
        let mut tx = self.pool.begin().await?;

        let old_exists = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
            .bind(old_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !old_exists {
            tx.rollback().await?;
            return Ok(RenameOutcome::Missing);
        }

        let new_exists = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
            .bind(new_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        let outcome = if new_exists {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(old_id.as_str())
                .execute(&mut *tx)
                .await?;
            RenameOutcome::Merged
        } else {
            sqlx::query("UPDATE messages SET id = ? WHERE id = ?")
                .bind(new_id.as_str())
                .bind(old_id.as_str())
                .execute(&mut *tx)
                .await?;
            RenameOutcome::Renamed
        };
        patch_row(&mut *tx, new_id, patch).await?;

        tx.commit()
            .await
            .with_context(|| format!("failed to commit rename {old_id} -> {new_id}"))?;
        Ok(outcome)
    }

    async fn delete(&self, id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete message {id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
