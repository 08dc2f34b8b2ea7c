//! Wire protocol types for the relay.
//!
//! Every frame is a JSON envelope `{"dataType": <string>, "data": <object>}`.
//! The kind is an exhaustive enum; payloads are decoded per kind with typed
//! decode calls so a partially-typed payload never reaches business logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::messaging::{Inbox, Message};

/// Envelope kind discriminator.
///
/// Unrecognized strings deserialize to the `Unknown` sentinel; the
/// dispatcher rejects it with an `InvalidDataType` error. Unknown kinds do
/// not round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    #[serde(rename = "InitData")]
    Init,
    #[serde(rename = "MessageData")]
    Message,
    #[serde(rename = "ThreadData")]
    Thread,
    #[serde(rename = "InboxData")]
    Inbox,
    #[serde(rename = "ErrorData")]
    Error,
    Unknown,
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "InitData" => Self::Init,
            "MessageData" => Self::Message,
            "ThreadData" => Self::Thread,
            "InboxData" => Self::Inbox,
            "ErrorData" => Self::Error,
            _ => Self::Unknown,
        })
    }
}

/// Error codes carried in `ErrorData` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Envelope or payload was malformed for its kind.
    InvalidData,
    /// Authentication failed or the connection is not authenticated.
    InvalidToken,
    /// The `dataType` is not one this server dispatches on.
    InvalidDataType,
    /// Storage or another downstream collaborator failed.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidData => "InvalidData",
            Self::InvalidToken => "InvalidToken",
            Self::InvalidDataType => "InvalidDataType",
            Self::Internal => "Internal",
        }
    }
}

/// The tagged message unit exchanged over a connection.
///
/// `recipient_id` is routing state for the hub only and never appears on
/// the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub data_type: DataType,
    pub data: Value,
    #[serde(skip)]
    pub recipient_id: String,
}

impl Envelope {
    /// Build an outbound envelope from a typed payload.
    pub fn new(data_type: DataType, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data_type,
            data: serde_json::to_value(payload)?,
            recipient_id: String::new(),
        })
    }

    /// An `ErrorData` envelope. Infallible: the payload shape is fixed.
    pub fn error(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            data_type: DataType::Error,
            data: json!({ "code": code.as_str(), "details": details.into() }),
            recipient_id: String::new(),
        }
    }

    /// A `MessageData` envelope carrying a stored message.
    pub fn message(message: &Message) -> Result<Self, serde_json::Error> {
        Self::new(DataType::Message, message)
    }

    /// An `InboxData` envelope.
    pub fn inbox(inbox: &Inbox) -> Result<Self, serde_json::Error> {
        Self::new(DataType::Inbox, inbox)
    }

    /// A `ThreadData` envelope carrying a page of messages.
    pub fn thread_page(messages: &[Message]) -> Result<Self, serde_json::Error> {
        Self::new(DataType::Thread, &messages)
    }

    /// Set the recipient identity the hub routes this envelope by.
    pub fn addressed_to(mut self, user_id: impl Into<String>) -> Self {
        self.recipient_id = user_id.into();
        self
    }

    /// Decode the payload into its kind-specific shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// `InitData` payload: the authentication handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub token: String,
    pub user_id: String,
}

/// Largest page a single thread query may request.
pub const MAX_THREAD_PAGE: i64 = 200;

/// Inbound `ThreadData` payload: a request for a page of a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadQueryPayload {
    pub thread_id: String,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(default)]
    pub skip: i64,
}

impl ThreadQueryPayload {
    /// Bound client-supplied paging. A negative LIMIT would reach SQLite,
    /// where it means unbounded.
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(0, MAX_THREAD_PAGE);
        self.skip = self.skip.max(0);
        self
    }
}

fn default_page_limit() -> i64 {
    50
}

/// `ErrorData` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub details: String,
}
