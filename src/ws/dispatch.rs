//! Per-connection envelope dispatch.
//!
//! One dispatcher per connection. It holds the connection's authenticated
//! identity (set exactly once by a successful `InitData`), answers request
//! kinds directly on the connection's own outbound queue, and hands
//! relay-bound envelopes to the hub for fan-out.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::auth::AuthError;
use crate::messaging::{Message, MessagingService};

use super::hub::{ConnId, HubHandle, Registration};
use super::types::{DataType, Envelope, ErrorCode, InitPayload, ThreadQueryPayload};
use tokio::sync::mpsc;

pub struct Dispatcher {
    conn_id: ConnId,
    hub: HubHandle,
    messaging: Arc<MessagingService>,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    /// Set on successful init, never changed afterwards.
    user_id: Option<String>,
    inbox_message_limit: i64,
}

impl Dispatcher {
    pub fn new(
        conn_id: ConnId,
        hub: HubHandle,
        messaging: Arc<MessagingService>,
        outbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
        inbox_message_limit: i64,
    ) -> Self {
        Self {
            conn_id,
            hub,
            messaging,
            outbound,
            cancel,
            user_id: None,
            inbox_message_limit,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Handle one inbound envelope. Errors are delivered to this connection
    /// only; a bad frame never terminates the session.
    pub async fn dispatch(&mut self, envelope: Envelope) {
        match envelope.data_type {
            DataType::Init => self.handle_init(&envelope).await,
            DataType::Message => self.handle_message(&envelope).await,
            DataType::Thread => self.handle_thread_query(&envelope).await,
            // Inbox is server-to-client; inbound it is a business kind that
            // still requires auth before it can be rejected as unsupported.
            DataType::Inbox if self.user_id.is_none() => {
                self.reply_error(ErrorCode::InvalidToken, "not authenticated")
                    .await;
            }
            DataType::Inbox | DataType::Error | DataType::Unknown => {
                self.reply_error(ErrorCode::InvalidDataType, "unsupported dataType")
                    .await;
            }
        }
    }

    /// `InitData`: authenticate and join the relay.
    ///
    /// The connection only becomes visible to the hub after the token
    /// verifies and matches the claimed identity. The reply is the caller's
    /// current inbox.
    async fn handle_init(&mut self, envelope: &Envelope) {
        if self.user_id.is_some() {
            self.reply_error(ErrorCode::InvalidData, "already authenticated")
                .await;
            return;
        }

        let init: InitPayload = match envelope.decode() {
            Ok(init) => init,
            Err(err) => {
                self.reply_error(ErrorCode::InvalidData, format!("malformed init: {err}"))
                    .await;
                return;
            }
        };

        let verified = match self.messaging.authenticate_token(&init.token) {
            Ok(user_id) => user_id,
            Err(err) => {
                debug!(conn_id = self.conn_id, "init rejected: {err}");
                self.reply_error(ErrorCode::InvalidToken, err.to_string())
                    .await;
                return;
            }
        };
        if verified != init.user_id {
            self.reply_error(ErrorCode::InvalidToken, AuthError::IdentityMismatch.to_string())
                .await;
            return;
        }

        self.user_id = Some(verified.clone());
        self.hub
            .register(Registration {
                conn_id: self.conn_id,
                user_id: verified.clone(),
                outbound: self.outbound.clone(),
                cancel: self.cancel.clone(),
            })
            .await;
        debug!(conn_id = self.conn_id, user_id = %verified, "connection authenticated");

        match self
            .messaging
            .get_inbox(&verified, self.inbox_message_limit)
            .await
        {
            Ok(inbox) => match Envelope::inbox(&inbox) {
                Ok(reply) => self.reply(reply).await,
                Err(err) => {
                    error!("encoding inbox: {err}");
                    self.reply_error(ErrorCode::Internal, "could not build inbox")
                        .await;
                }
            },
            Err(err) => {
                error!(user_id = %verified, "fetching inbox: {err:?}");
                self.reply_error(ErrorCode::Internal, "could not fetch inbox")
                    .await;
            }
        }
    }

    /// `MessageData`: persist, then relay to both participants.
    async fn handle_message(&mut self, envelope: &Envelope) {
        let Some(sender) = self.user_id.clone() else {
            self.reply_error(ErrorCode::InvalidToken, "not authenticated")
                .await;
            return;
        };

        let mut message: Message = match envelope.decode() {
            Ok(message) => message,
            Err(err) => {
                self.reply_error(ErrorCode::InvalidData, format!("malformed message: {err}"))
                    .await;
                return;
            }
        };
        message.created_at = Utc::now();

        if let Err(err) = self.messaging.store_message(&mut message).await {
            error!(user_id = %sender, "storing message: {err:?}");
            self.reply_error(ErrorCode::Internal, "could not store message")
                .await;
            return;
        }

        // Stored-then-relayed: the sender's echo confirms persistence and
        // carries the resolved threadId and createdAt.
        let outbound = match Envelope::message(&message) {
            Ok(outbound) => outbound,
            Err(err) => {
                error!("encoding message: {err}");
                self.reply_error(ErrorCode::Internal, "could not encode message")
                    .await;
                return;
            }
        };
        self.hub
            .route(outbound.clone().addressed_to(&message.receiver_id))
            .await;
        self.hub.route(outbound.addressed_to(&message.sender_id)).await;
    }

    /// Inbound `ThreadData`: fetch a page of one thread.
    async fn handle_thread_query(&mut self, envelope: &Envelope) {
        if self.user_id.is_none() {
            self.reply_error(ErrorCode::InvalidToken, "not authenticated")
                .await;
            return;
        }

        let query: ThreadQueryPayload = match envelope.decode::<ThreadQueryPayload>() {
            Ok(query) => query.clamped(),
            Err(err) => {
                self.reply_error(ErrorCode::InvalidData, format!("malformed query: {err}"))
                    .await;
                return;
            }
        };

        match self
            .messaging
            .get_thread_messages(&query.thread_id, query.limit, query.skip)
            .await
        {
            Ok(messages) => match Envelope::thread_page(&messages) {
                Ok(reply) => self.reply(reply).await,
                Err(err) => {
                    error!("encoding thread page: {err}");
                    self.reply_error(ErrorCode::Internal, "could not build thread page")
                        .await;
                }
            },
            Err(err) => {
                error!(thread_id = %query.thread_id, "fetching thread: {err:?}");
                self.reply_error(ErrorCode::Internal, "could not fetch thread")
                    .await;
            }
        }
    }

    /// Send a reply straight to this connection, bypassing the hub.
    async fn reply(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            warn!(conn_id = self.conn_id, "outbound queue closed, reply dropped");
        }
    }

    pub async fn reply_error(&self, code: ErrorCode, details: impl Into<String>) {
        self.reply(Envelope::error(code, details)).await;
    }
}
