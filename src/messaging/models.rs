//! Messaging entities as they appear on the wire and in storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single chat message.
///
/// Inbound payloads carry neither `threadId` nor `createdAt`; both are
/// assigned server-side before the message is persisted or routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub thread_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: String,
    pub message_body: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// A conversation thread between exactly two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub thread_id: String,
    pub user_id1: String,
    pub user_id2: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

/// A user's inbox: their threads, most-recently-updated first, each
/// populated with a page of most-recent messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inbox {
    pub threads: Vec<Thread>,
}
