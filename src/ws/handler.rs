//! WebSocket endpoint: upgrade, socket loops, connection lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::messaging::MessagingService;

use super::dispatch::Dispatcher;
use super::hub::{ConnId, HubHandle};
use super::types::{Envelope, ErrorCode};

/// Largest accepted inbound frame.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Tunables for a single relay connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// A connection that produces no frame (including pong) for this long
    /// is considered dead.
    pub read_idle: Duration,
    /// Interval between server pings. Must be shorter than `read_idle`.
    pub ping_interval: Duration,
    /// Depth of the per-connection outbound queue.
    pub outbound_queue_size: usize,
    /// Messages loaded per thread when assembling an inbox reply.
    pub inbox_message_limit: i64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read_idle: Duration::from_secs(60),
            ping_interval: Duration::from_secs(50),
            outbound_queue_size: 64,
            inbox_message_limit: 30,
        }
    }
}

/// WebSocket upgrade handler.
///
/// GET /ws
///
/// The upgrade itself is unauthenticated; the connection must present an
/// `InitData` envelope before it can do anything but receive errors.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let conn_id = state.hub.allocate_conn_id();
    debug!(conn_id, "websocket upgrade request");

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_connection(socket, state, conn_id))
}

/// Drive one connection to completion.
async fn handle_connection(socket: WebSocket, state: AppState, conn_id: ConnId) {
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(state.relay.outbound_queue_size);
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        state.relay.ping_interval,
        cancel.clone(),
        conn_id,
    ));

    read_loop(
        stream,
        conn_id,
        state.hub.clone(),
        Arc::clone(&state.messaging),
        out_tx,
        cancel.clone(),
        &state.relay,
    )
    .await;

    // Teardown. Unregister first so the hub stops routing to this
    // connection, then stop the writer.
    cancel.cancel();
    state.hub.unregister(conn_id).await;
    if tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        warn!(conn_id, "writer did not stop in time");
    }
    info!(conn_id, "connection closed");
}

/// Consume inbound frames and feed the dispatcher.
///
/// Returns when the peer closes, errors, or goes idle past the deadline.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    conn_id: ConnId,
    hub: HubHandle,
    messaging: Arc<MessagingService>,
    out_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    settings: &RelaySettings,
) {
    let mut dispatcher = Dispatcher::new(
        conn_id,
        hub,
        messaging,
        out_tx,
        cancel.clone(),
        settings.inbox_message_limit,
    );

    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(settings.read_idle, stream.next()) => frame,
            _ = cancel.cancelled() => {
                debug!(conn_id, "reader cancelled");
                return;
            }
        };

        // Any frame counts as liveness; the timeout restarts per iteration.
        match frame {
            Err(_) => {
                info!(conn_id, "connection idle past deadline, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                warn!(conn_id, "websocket error: {err}");
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => dispatcher.dispatch(envelope).await,
                    Err(err) => {
                        debug!(conn_id, "unparseable frame: {err}");
                        dispatcher
                            .reply_error(ErrorCode::InvalidData, format!("invalid envelope: {err}"))
                            .await;
                    }
                }
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                dispatcher
                    .reply_error(ErrorCode::InvalidData, "binary frames are not supported")
                    .await;
            }
            // axum answers pings itself; both directions just reset the
            // idle deadline here.
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(Message::Close(_)))) => {
                debug!(conn_id, "peer closed connection");
                return;
            }
        }
    }
}

/// Serialize queued envelopes onto the socket and keep the peer alive.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Envelope>,
    ping_interval: Duration,
    cancel: CancellationToken,
    conn_id: ConnId,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            envelope = out_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(conn_id, "failed to serialize envelope: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    // Ensure the reader side also winds down when the socket dies first.
    cancel.cancel();
}
