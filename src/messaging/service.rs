//! Messaging service: thread resolution, persistence, inbox assembly.

use anyhow::{Context, Result};
use tracing::warn;

use crate::auth::{AuthError, AuthState};

use super::models::{Inbox, Message, Thread};
use super::repository::MessagingRepository;
use super::thread_id::derive_thread_id;

/// Stateless orchestration over the repository and the token verifier.
#[derive(Clone)]
pub struct MessagingService {
    repo: MessagingRepository,
    auth: AuthState,
}

impl MessagingService {
    pub fn new(repo: MessagingRepository, auth: AuthState) -> Self {
        Self { repo, auth }
    }

    /// Verify a token and return the user id it belongs to.
    pub fn authenticate_token(&self, token: &str) -> Result<String, AuthError> {
        self.auth.verify_token(token)
    }

    /// Persist a message, creating its thread on first contact.
    ///
    /// Resolves `thread_id` on the message in place. The thread upsert also
    /// bumps `updated_at`, which is what keeps the inbox ordered by latest
    /// activity. The message is not considered sent if either write fails.
    pub async fn store_message(&self, message: &mut Message) -> Result<()> {
        message.thread_id = derive_thread_id(&message.sender_id, &message.receiver_id);

        let thread = Thread {
            thread_id: message.thread_id.clone(),
            user_id1: message.sender_id.clone(),
            user_id2: message.receiver_id.clone(),
            messages: Vec::new(),
            updated_at: message.created_at,
        };
        self.repo
            .upsert_thread(&thread)
            .await
            .context("resolving thread for message")?;

        self.repo
            .insert_message(message)
            .await
            .context("storing message")?;
        Ok(())
    }

    /// A user's threads, most-recently-updated first, each populated with up
    /// to `per_thread_limit` most-recent messages.
    ///
    /// A failure fetching one thread's messages degrades that thread to an
    /// empty message list instead of failing the whole inbox.
    pub async fn get_inbox(&self, user_id: &str, per_thread_limit: i64) -> Result<Inbox> {
        let mut threads = self
            .repo
            .list_threads_by_user(user_id)
            .await
            .context("fetching inbox threads")?;

        for thread in &mut threads {
            match self
                .repo
                .list_messages_by_thread(&thread.thread_id, per_thread_limit, 0)
                .await
            {
                Ok(messages) => thread.messages = messages,
                Err(err) => {
                    warn!(
                        thread_id = %thread.thread_id,
                        "could not fetch messages for inbox thread: {err:?}"
                    );
                }
            }
        }

        Ok(Inbox { threads })
    }

    /// A page of messages for a thread, most-recent-first.
    pub async fn get_thread_messages(
        &self,
        thread_id: &str,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>> {
        self.repo
            .list_messages_by_thread(thread_id, limit, skip)
            .await
            .context("fetching thread messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::db::Database;
    use chrono::{Duration, Utc};
    use serde_json::json;

    async fn setup() -> (MessagingService, Database) {
        let db = Database::in_memory().await.unwrap();
        let auth = AuthState::new(AuthConfig {
            jwt_secret: Some("unit-test-secret-with-at-least-32-chars".to_string()),
            system_token: None,
        })
        .unwrap();
        let service = MessagingService::new(MessagingRepository::new(db.pool().clone()), auth);
        (service, db)
    }

    fn inbound(from: &str, to: &str, body: &str) -> Message {
        Message {
            thread_id: String::new(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            message_type: "text".to_string(),
            message_body: json!(body),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_message_creates_thread_once() {
        let (service, _db) = setup().await;

        let mut first = inbound("u1", "u2", "hello");
        service.store_message(&mut first).await.unwrap();
        assert_eq!(first.thread_id, derive_thread_id("u1", "u2"));

        // Reply in the other direction lands in the same thread.
        let mut reply = inbound("u2", "u1", "hi back");
        reply.created_at = first.created_at + Duration::seconds(1);
        service.store_message(&mut reply).await.unwrap();
        assert_eq!(reply.thread_id, first.thread_id);

        let inbox = service.get_inbox("u1", 10).await.unwrap();
        assert_eq!(inbox.threads.len(), 1);
        assert_eq!(inbox.threads[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_inbox_ordering() {
        let (service, _db) = setup().await;
        let base = Utc::now();

        let mut to_u2 = inbound("u1", "u2", "first");
        to_u2.created_at = base;
        service.store_message(&mut to_u2).await.unwrap();

        let mut to_u3 = inbound("u1", "u3", "second");
        to_u3.created_at = base + Duration::seconds(5);
        service.store_message(&mut to_u3).await.unwrap();

        let inbox = service.get_inbox("u1", 10).await.unwrap();
        assert_eq!(inbox.threads.len(), 2);
        assert_eq!(inbox.threads[0].thread_id, derive_thread_id("u1", "u3"));

        // A new message into the older thread moves it to the front.
        let mut bump = inbound("u2", "u1", "third");
        bump.created_at = base + Duration::seconds(10);
        service.store_message(&mut bump).await.unwrap();

        let inbox = service.get_inbox("u1", 10).await.unwrap();
        assert_eq!(inbox.threads[0].thread_id, derive_thread_id("u1", "u2"));

        // Messages within a thread are most-recent-first.
        assert_eq!(inbox.threads[0].messages[0].message_body, json!("third"));
        assert_eq!(inbox.threads[0].messages[1].message_body, json!("first"));
    }

    #[tokio::test]
    async fn test_inbox_respects_per_thread_limit() {
        let (service, _db) = setup().await;
        let base = Utc::now();

        for i in 0..5 {
            let mut msg = inbound("u1", "u2", &format!("m{i}"));
            msg.created_at = base + Duration::seconds(i);
            service.store_message(&mut msg).await.unwrap();
        }

        let inbox = service.get_inbox("u2", 2).await.unwrap();
        assert_eq!(inbox.threads[0].messages.len(), 2);
        assert_eq!(inbox.threads[0].messages[0].message_body, json!("m4"));
    }

    #[tokio::test]
    async fn test_inbox_degrades_thread_with_unreadable_messages() {
        let (service, db) = setup().await;
        let base = Utc::now();

        let mut good = inbound("u1", "u2", "fine");
        good.created_at = base;
        service.store_message(&mut good).await.unwrap();

        let mut other = inbound("u1", "u3", "also fine");
        other.created_at = base + Duration::seconds(1);
        service.store_message(&mut other).await.unwrap();

        // Corrupt one thread's page: a body that is not valid JSON makes the
        // whole message fetch for that thread fail.
        sqlx::query(
            "INSERT INTO messages (thread_id, sender_id, receiver_id, message_type, message_body, created_at)
             VALUES (?, 'u1', 'u2', 'text', 'not json', ?)",
        )
        .bind(&good.thread_id)
        .bind(base + Duration::seconds(2))
        .execute(db.pool())
        .await
        .unwrap();

        // The broken thread is still listed, just without messages; the
        // healthy thread is untouched.
        let inbox = service.get_inbox("u1", 10).await.unwrap();
        assert_eq!(inbox.threads.len(), 2);

        let broken = inbox
            .threads
            .iter()
            .find(|t| t.thread_id == good.thread_id)
            .unwrap();
        assert!(broken.messages.is_empty());

        let healthy = inbox
            .threads
            .iter()
            .find(|t| t.thread_id == other.thread_id)
            .unwrap();
        assert_eq!(healthy.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_inbox() {
        let (service, _db) = setup().await;
        let inbox = service.get_inbox("nobody", 10).await.unwrap();
        assert!(inbox.threads.is_empty());
    }

    #[tokio::test]
    async fn test_thread_pagination() {
        let (service, _db) = setup().await;
        let base = Utc::now();

        let mut msg = inbound("u1", "u2", "m0");
        msg.created_at = base;
        service.store_message(&mut msg).await.unwrap();
        let tid = msg.thread_id.clone();

        for i in 1..4 {
            let mut msg = inbound("u1", "u2", &format!("m{i}"));
            msg.created_at = base + Duration::seconds(i);
            service.store_message(&mut msg).await.unwrap();
        }

        let page = service.get_thread_messages(&tid, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message_body, json!("m2"));
        assert_eq!(page[1].message_body, json!("m1"));
    }
}
