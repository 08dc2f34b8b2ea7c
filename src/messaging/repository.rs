//! SQLite persistence for threads and messages.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{Message, Thread};
use super::thread_id::derive_thread_id;

/// Raw message row; `message_body` is stored as JSON text.
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    thread_id: String,
    sender_id: String,
    receiver_id: String,
    message_type: String,
    message_body: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let message_body =
            serde_json::from_str(&row.message_body).context("parsing stored message body")?;
        Ok(Message {
            thread_id: row.thread_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            message_type: row.message_type,
            message_body,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ThreadRow {
    thread_id: String,
    user_id1: String,
    user_id2: String,
    updated_at: DateTime<Utc>,
}

impl From<ThreadRow> for Thread {
    fn from(row: ThreadRow) -> Self {
        Thread {
            thread_id: row.thread_id,
            user_id1: row.user_id1,
            user_id2: row.user_id2,
            messages: Vec::new(),
            updated_at: row.updated_at,
        }
    }
}

/// Repository for messaging persistence.
#[derive(Debug, Clone)]
pub struct MessagingRepository {
    pool: SqlitePool,
}

impl MessagingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a thread, or bump `updated_at` if it already exists.
    ///
    /// The upsert keyed on the derived thread id is what makes
    /// find-or-create atomic: two concurrent stores between the same pair
    /// both land on the same row. The original participant columns are
    /// preserved on conflict.
    pub async fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, user_id1, user_id2, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(&thread.thread_id)
        .bind(&thread.user_id1)
        .bind(&thread.user_id2)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await
        .context("upserting thread")?;
        Ok(())
    }

    /// Append a message. The caller must have resolved `thread_id` first.
    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_string(&message.message_body)
            .context("serializing message body")?;

        sqlx::query(
            r#"
            INSERT INTO messages (thread_id, sender_id, receiver_id, message_type, message_body, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.thread_id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.message_type)
        .bind(&body)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("inserting message")?;
        Ok(())
    }

    /// Find the thread for an unordered user pair, if it exists.
    pub async fn find_thread_by_users(
        &self,
        user_id: &str,
        other_user_id: &str,
    ) -> Result<Option<Thread>> {
        let thread_id = derive_thread_id(user_id, other_user_id);
        let row = sqlx::query_as::<_, ThreadRow>(
            "SELECT thread_id, user_id1, user_id2, updated_at FROM threads WHERE thread_id = ?",
        )
        .bind(&thread_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching thread by users")?;
        Ok(row.map(Thread::from))
    }

    /// All threads involving a user, most-recently-updated first.
    pub async fn list_threads_by_user(&self, user_id: &str) -> Result<Vec<Thread>> {
        let rows = sqlx::query_as::<_, ThreadRow>(
            r#"
            SELECT thread_id, user_id1, user_id2, updated_at
            FROM threads
            WHERE user_id1 = ? OR user_id2 = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing threads by user")?;
        Ok(rows.into_iter().map(Thread::from).collect())
    }

    /// A page of messages for a thread, most-recent-first.
    pub async fn list_messages_by_thread(
        &self,
        thread_id: &str,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT thread_id, sender_id, receiver_id, message_type, message_body, created_at
            FROM messages
            WHERE thread_id = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(thread_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("listing messages by thread")?;

        rows.into_iter().map(Message::try_from).collect()
    }
}
