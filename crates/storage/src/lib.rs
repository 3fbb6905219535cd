use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{AttachmentId, AttachmentRef, ChatMessage, MessageId, NewMessage, UserId},
    protocol::DEFAULT_CONTENT_TYPE,
};

/// Append-only chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId>;

    /// Every stored message, in insertion order.
    async fn message_history(&self) -> Result<Vec<ChatMessage>>;
}

/// Out-of-band storage for message attachments.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn store_attachment(
        &self,
        bytes: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<AttachmentId>;

    async fn load_attachment(&self, attachment_id: &AttachmentId)
        -> Result<Option<StoredAttachment>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns `false` when the user id is already taken.
    async fn create_user(&self, user_id: &UserId, password_hash: &str) -> Result<bool>;

    async fn password_hash_for(&self, user_id: &UserId) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub bytes: Vec<u8>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }
        // a shared-cache memory database reports SQLITE_LOCKED instead of
        // waiting, so it gets a single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn message_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        let attachment = message.attachment.as_ref();
        let rec = sqlx::query(
            "INSERT INTO messages (user_id, room_id, text, sent_at, attachment_id, attachment_name, attachment_content_type)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.user_id.as_str())
        .bind(&message.room_id)
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(attachment.map(|a| a.attachment_id.as_str()))
        .bind(attachment.map(|a| a.file_name.as_str()))
        .bind(attachment.map(|a| a.content_type.as_str()))
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    async fn message_history(&self) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, user_id, room_id, text, sent_at, attachment_id, attachment_name, attachment_content_type
             FROM messages
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load message history")?;

        Ok(rows
            .into_iter()
            .map(|r| ChatMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<String, _>(1)),
                room_id: r.get::<String, _>(2),
                text: r.get::<String, _>(3),
                timestamp: r.get::<DateTime<Utc>, _>(4),
                attachment: r
                    .get::<Option<String>, _>(5)
                    .map(|attachment_id| AttachmentRef {
                        attachment_id: AttachmentId(attachment_id),
                        file_name: r.get::<Option<String>, _>(6).unwrap_or_default(),
                        content_type: r
                            .get::<Option<String>, _>(7)
                            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                    }),
            })
            .collect())
    }
}

#[async_trait]
impl AttachmentStore for Storage {
    async fn store_attachment(
        &self,
        bytes: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> Result<AttachmentId> {
        let attachment_id = AttachmentId::generate();
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO attachments (id, file_name, content_type, size_bytes, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(attachment_id.as_str())
        .bind(file_name)
        .bind(content_type)
        .bind(size_bytes)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .context("failed to store attachment")?;
        Ok(attachment_id)
    }

    async fn load_attachment(
        &self,
        attachment_id: &AttachmentId,
    ) -> Result<Option<StoredAttachment>> {
        let row = sqlx::query(
            "SELECT id, file_name, content_type, size_bytes, data FROM attachments WHERE id = ?",
        )
        .bind(attachment_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to load attachment")?;
        Ok(row.map(|r| StoredAttachment {
            attachment_id: AttachmentId(r.get::<String, _>(0)),
            file_name: r.get::<String, _>(1),
            content_type: Some(r.get::<String, _>(2))
                .filter(|content_type| !content_type.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size_bytes: r.get::<i64, _>(3) as u64,
            bytes: r.get::<Vec<u8>, _>(4),
        }))
    }
}

#[async_trait]
impl UserStore for Storage {
    async fn create_user(&self, user_id: &UserId, password_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (user_id, password_hash) VALUES (?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id.as_str())
        .bind(password_hash)
        .execute(&self.pool)
        .await
        .context("failed to create user")?;
        Ok(result.rows_affected() == 1)
    }

    async fn password_hash_for(&self, user_id: &UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT password_hash FROM users WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
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
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
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
