use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{
    FeedFilter, MessageId, MessageRecord, NotificationEntry, NotificationQueueRecord, UserRecord,
};

/// Document store for the feed. Records are keyed by identity (users,
/// notification queues) or message id, and every update is a full-record
/// replace. There are no cross-record transactions: multi-record operations
/// upstream are sequential independent writes.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                email     TEXT PRIMARY KEY,
                following TEXT NOT NULL,
                followers TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_queues (
                email TEXT PRIMARY KEY,
                queue TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure notification_queues table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id           TEXT PRIMARY KEY,
                author       TEXT NOT NULL,
                content      TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                likes        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        Ok(())
    }

    pub async fn fetch_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT email, following, followers FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(UserRecord {
                email: r.get::<String, _>(0),
                following: decode_emails(&r.get::<String, _>(1))?,
                followers: decode_emails(&r.get::<String, _>(2))?,
            })
        })
        .transpose()
    }

    pub async fn insert_user(&self, record: &UserRecord) -> Result<()> {
        sqlx::query("INSERT INTO users (email, following, followers) VALUES (?, ?, ?)")
            .bind(&record.email)
            .bind(encode_emails(&record.following)?)
            .bind(encode_emails(&record.followers)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert user record for '{}'", record.email))?;
        Ok(())
    }

    /// Full-record replace by key. Returns false when no record exists.
    pub async fn update_user(&self, record: &UserRecord) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET following = ?, followers = ? WHERE email = ?")
            .bind(encode_emails(&record.following)?)
            .bind(encode_emails(&record.followers)?)
            .bind(&record.email)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Every user record, in key order. The social graph is small enough
    /// that reconciliation scans it whole.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT email, following, followers FROM users ORDER BY email ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(UserRecord {
                    email: r.get::<String, _>(0),
                    following: decode_emails(&r.get::<String, _>(1))?,
                    followers: decode_emails(&r.get::<String, _>(2))?,
                })
            })
            .collect()
    }

    pub async fn fetch_queue(&self, email: &str) -> Result<Option<NotificationQueueRecord>> {
        let row = sqlx::query("SELECT email, queue FROM notification_queues WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(NotificationQueueRecord {
                email: r.get::<String, _>(0),
                queue: decode_queue(&r.get::<String, _>(1))?,
            })
        })
        .transpose()
    }

    pub async fn insert_queue(&self, record: &NotificationQueueRecord) -> Result<()> {
        sqlx::query("INSERT INTO notification_queues (email, queue) VALUES (?, ?)")
            .bind(&record.email)
            .bind(encode_queue(&record.queue)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert queue record for '{}'", record.email))?;
        Ok(())
    }

    /// Full-record replace by key. Returns false when no record exists.
    pub async fn update_queue(&self, record: &NotificationQueueRecord) -> Result<bool> {
        let updated = sqlx::query("UPDATE notification_queues SET queue = ? WHERE email = ?")
            .bind(encode_queue(&record.queue)?)
            .bind(&record.email)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    pub async fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, author, content, submitted_at, likes) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.id.0.to_string())
        .bind(&record.author)
        .bind(&record.content)
        .bind(record.submitted_at)
        .bind(encode_emails(&record.likes)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert message {}", record.id))?;
        Ok(())
    }

    pub async fn fetch_message(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT id, author, content, submitted_at, likes FROM messages WHERE id = ?",
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    /// Full-record replace by key. Returns false when no record exists.
    pub async fn update_message(&self, record: &MessageRecord) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET author = ?, content = ?, submitted_at = ?, likes = ? WHERE id = ?",
        )
        .bind(&record.author)
        .bind(&record.content)
        .bind(record.submitted_at)
        .bind(encode_emails(&record.likes)?)
        .bind(record.id.0.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn remove_message(&self, id: MessageId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Newest-first listing, optionally restricted to one author.
    pub async fn list_messages(&self, filter: &FeedFilter, limit: u32) -> Result<Vec<MessageRecord>> {
        let rows = match filter {
            FeedFilter::All => {
                sqlx::query(
                    "SELECT id, author, content, submitted_at, likes
                     FROM messages
                     ORDER BY submitted_at DESC, rowid DESC
                     LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            FeedFilter::Mine(email) => {
                sqlx::query(
                    "SELECT id, author, content, submitted_at, likes
                     FROM messages
                     WHERE author = ?
                     ORDER BY submitted_at DESC, rowid DESC
                     LIMIT ?",
                )
                .bind(email)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(message_from_row).collect()
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    let raw_id = row.get::<String, _>(0);
    let id = Uuid::parse_str(&raw_id)
        .with_context(|| format!("malformed message id '{raw_id}' in store"))?;
    Ok(MessageRecord {
        id: MessageId(id),
        author: row.get::<String, _>(1),
        content: row.get::<String, _>(2),
        submitted_at: row.get::<DateTime<Utc>, _>(3),
        likes: decode_emails(&row.get::<String, _>(4))?,
    })
}

fn encode_emails(list: &[String]) -> Result<String> {
    serde_json::to_string(list).context("failed to encode membership list")
}

fn decode_emails(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).context("malformed membership list in store")
}

fn encode_queue(queue: &[NotificationEntry]) -> Result<String> {
    serde_json::to_string(queue).context("failed to encode notification queue")
}

fn decode_queue(raw: &str) -> Result<Vec<NotificationEntry>> {
    serde_json::from_str(raw).context("malformed notification queue in store")
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
