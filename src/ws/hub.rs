//! Connection registry and envelope router.
//!
//! The hub is a single task that owns the registry of live, authenticated
//! connections. Everything else talks to it through a cloneable
//! [`HubHandle`]; registry mutation and routing happen only inside the hub
//! task, so the map needs no lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::Envelope;

/// Per-process connection identity, distinct from user identity so a user
/// can hold several connections at once.
pub type ConnId = u64;

/// What the hub does when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Force-unregister the slow connection. A consumer that cannot keep up
    /// stops receiving silently-inconsistent state and reconnects instead.
    #[default]
    DisconnectSlow,
    /// Drop the envelope for that connection and keep it registered.
    DropEnvelope,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the hub's own command channels.
    pub channel_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Everything the hub needs to know about a joining connection.
pub struct Registration {
    pub conn_id: ConnId,
    pub user_id: String,
    pub outbound: mpsc::Sender<Envelope>,
    pub cancel: CancellationToken,
}

struct ConnectionEntry {
    user_id: String,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

/// The hub task. Construct with [`Hub::new`], then `tokio::spawn(hub.run())`.
pub struct Hub {
    connections: HashMap<ConnId, ConnectionEntry>,
    overflow: OverflowPolicy,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ConnId>,
    route_rx: mpsc::Receiver<Envelope>,
}

/// Cloneable handle for talking to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ConnId>,
    route_tx: mpsc::Sender<Envelope>,
    next_conn_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.channel_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.channel_capacity);
        let (route_tx, route_rx) = mpsc::channel(config.channel_capacity);

        let hub = Self {
            connections: HashMap::new(),
            overflow: config.overflow,
            register_rx,
            unregister_rx,
            route_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            route_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Drive the hub until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(registration) = self.register_rx.recv() => {
                    self.register(registration);
                }
                Some(conn_id) = self.unregister_rx.recv() => {
                    self.unregister(conn_id);
                }
                Some(envelope) = self.route_rx.recv() => {
                    self.route(envelope);
                }
                else => break,
            }
        }
        info!("hub shutting down");
    }

    fn register(&mut self, registration: Registration) {
        debug!(
            conn_id = registration.conn_id,
            user_id = %registration.user_id,
            "connection registered"
        );
        self.connections.insert(
            registration.conn_id,
            ConnectionEntry {
                user_id: registration.user_id,
                outbound: registration.outbound,
                cancel: registration.cancel,
            },
        );
    }

    /// Remove a connection and cancel its tasks. Safe to call for a
    /// connection that was never registered or is already gone.
    fn unregister(&mut self, conn_id: ConnId) {
        if let Some(entry) = self.connections.remove(&conn_id) {
            debug!(conn_id, user_id = %entry.user_id, "connection unregistered");
            entry.cancel.cancel();
        }
    }

    /// Deliver an envelope to every connection of its recipient.
    fn route(&mut self, envelope: Envelope) {
        let mut dead = Vec::new();

        for (&conn_id, entry) in &self.connections {
            if entry.user_id != envelope.recipient_id {
                continue;
            }
            match entry.outbound.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => match self.overflow {
                    OverflowPolicy::DisconnectSlow => {
                        warn!(
                            conn_id,
                            user_id = %entry.user_id,
                            "outbound queue full, disconnecting slow consumer"
                        );
                        dead.push(conn_id);
                    }
                    OverflowPolicy::DropEnvelope => {
                        warn!(
                            conn_id,
                            user_id = %entry.user_id,
                            "outbound queue full, dropping envelope"
                        );
                    }
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(conn_id);
                }
            }
        }

        for conn_id in dead {
            self.unregister(conn_id);
        }
    }
}

impl HubHandle {
    /// Allocate a process-unique connection id.
    pub fn allocate_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, registration: Registration) {
        if self.register_tx.send(registration).await.is_err() {
            warn!("hub is gone, registration dropped");
        }
    }

    pub async fn unregister(&self, conn_id: ConnId) {
        if self.unregister_tx.send(conn_id).await.is_err() {
            warn!(conn_id, "hub is gone, unregister dropped");
        }
    }

    /// Submit an envelope for delivery to `envelope.recipient_id`.
    pub async fn route(&self, envelope: Envelope) {
        if self.route_tx.send(envelope).await.is_err() {
            warn!("hub is gone, envelope dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::ErrorCode;
    use tokio::time::{Duration, timeout};

    async fn join(
        handle: &HubHandle,
        user_id: &str,
        queue: usize,
    ) -> (ConnId, mpsc::Receiver<Envelope>, CancellationToken) {
        let conn_id = handle.allocate_conn_id();
        let (tx, rx) = mpsc::channel(queue);
        let cancel = CancellationToken::new();
        handle
            .register(Registration {
                conn_id,
                user_id: user_id.to_string(),
                outbound: tx,
                cancel: cancel.clone(),
            })
            .await;
        // Registration and routing travel on separate channels; let the hub
        // drain the registration before the test routes anything.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (conn_id, rx, cancel)
    }

    fn note(to: &str, text: &str) -> Envelope {
        Envelope::error(ErrorCode::Internal, text).addressed_to(to)
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_routes_only_to_recipient() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (_, mut rx1, _) = join(&handle, "u1", 8).await;
        let (_, mut rx2, _) = join(&handle, "u2", 8).await;

        handle.route(note("u2", "for u2")).await;
        let got = recv(&mut rx2).await;
        assert_eq!(got.recipient_id, "u2");

        // u1 saw nothing.
        assert!(
            timeout(Duration::from_millis(50), rx1.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_routes_to_all_connections_of_user() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (_, mut rx_a, _) = join(&handle, "u1", 8).await;
        let (_, mut rx_b, _) = join(&handle, "u1", 8).await;

        handle.route(note("u1", "fanout")).await;
        recv(&mut rx_a).await;
        recv(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_cancels() {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());

        let (conn_id, mut rx, cancel) = join(&handle, "u1", 8).await;
        handle.unregister(conn_id).await;
        handle.unregister(conn_id).await;

        cancel.cancelled().await;

        // Envelopes for the user no longer reach the removed connection.
        handle.route(note("u1", "late")).await;
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_overflow_disconnects_slow_consumer() {
        let (hub, handle) = Hub::new(HubConfig {
            channel_capacity: 64,
            overflow: OverflowPolicy::DisconnectSlow,
        });
        tokio::spawn(hub.run());

        // Queue of 1, never drained: second routed envelope overflows it.
        let (_, _rx, cancel) = join(&handle, "u1", 1).await;
        handle.route(note("u1", "fills the queue")).await;
        handle.route(note("u1", "overflows")).await;

        timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("slow consumer was not disconnected");
    }

    #[tokio::test]
    async fn test_overflow_drop_policy_keeps_connection() {
        let (hub, handle) = Hub::new(HubConfig {
            channel_capacity: 64,
            overflow: OverflowPolicy::DropEnvelope,
        });
        tokio::spawn(hub.run());

        let (_, mut rx, cancel) = join(&handle, "u1", 1).await;
        handle.route(note("u1", "kept")).await;
        handle.route(note("u1", "dropped")).await;

        // Still registered: draining the queue lets new envelopes through.
        recv(&mut rx).await;
        handle.route(note("u1", "after drain")).await;
        recv(&mut rx).await;
        assert!(!cancel.is_cancelled());
    }
}
