//! SQLite persistence.
//!
//! The realtime core only touches two tables: `message` (chat history
//! written by the chat send core) and `user` (existence checks for status
//! follows). Everything else the wider platform persists lives behind
//! other services and is out of this daemon's hands.

use arena_proto::Stream;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Database handle, cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message (
                id TEXT PRIMARY KEY,
                stream_mode INTEGER NOT NULL,
                stream_subject TEXT NOT NULL,
                stream_subcontext TEXT NOT NULL,
                stream_label TEXT NOT NULL,
                code INTEGER NOT NULL,
                sender_id TEXT NOT NULL,
                username TEXT NOT NULL,
                content TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_message_stream
            ON message (stream_mode, stream_subject, stream_subcontext, stream_label, create_time)
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                create_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!(path = %path, "Database initialized");
        Ok(Self { pool })
    }

    pub fn messages(&self) -> MessageRepo<'_> {
        MessageRepo { pool: &self.pool }
    }

    pub fn users(&self) -> UserRepo<'_> {
        UserRepo { pool: &self.pool }
    }
}

/// One persisted chat message.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: Uuid,
    pub stream: Stream,
    pub code: i32,
    pub sender_id: Uuid,
    pub username: String,
    pub content: String,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

pub struct MessageRepo<'a> {
    pool: &'a SqlitePool,
}

impl MessageRepo<'_> {
    pub async fn insert(&self, row: &MessageRow) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO message (
                id, stream_mode, stream_subject, stream_subcontext, stream_label,
                code, sender_id, username, content, create_time, update_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.to_string())
        .bind(i64::from(u8::from(row.stream.mode)))
        .bind(row.stream.subject.to_string())
        .bind(row.stream.subcontext.to_string())
        .bind(row.stream.label.clone())
        .bind(i64::from(row.code))
        .bind(row.sender_id.to_string())
        .bind(row.username.clone())
        .bind(row.content.clone())
        .bind(row.create_time_ms)
        .bind(row.update_time_ms)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    #[allow(dead_code)] // Consumed by the history surface
    pub async fn count_by_stream(&self, stream: &Stream) -> Result<i64, DbError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM message
            WHERE stream_mode = ? AND stream_subject = ? AND stream_subcontext = ? AND stream_label = ?
            "#,
        )
        .bind(i64::from(u8::from(stream.mode)))
        .bind(stream.subject.to_string())
        .bind(stream.subcontext.to_string())
        .bind(stream.label.clone())
        .fetch_one(self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

pub struct UserRepo<'a> {
    pool: &'a SqlitePool,
}

impl UserRepo<'_> {
    pub async fn exists(&self, user_id: Uuid) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM user WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_one(self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    pub async fn id_by_username(&self, username: &str) -> Result<Option<Uuid>, DbError> {
        let row = sqlx::query("SELECT id FROM user WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.and_then(|r| Uuid::parse_str(&r.get::<String, _>("id")).ok()))
    }

    /// Upsert a user row. The account service owns this table; the daemon
    /// only writes it on behalf of tests and local tooling.
    #[allow(dead_code)]
    pub async fn ensure(&self, user_id: Uuid, username: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO user (id, username, create_time) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username",
        )
        .bind(user_id.to_string())
        .bind(username)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool)
        .await?;
        Ok(())
    }
}
