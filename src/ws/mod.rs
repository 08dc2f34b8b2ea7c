//! WebSocket relay: wire protocol, per-connection dispatch, and the hub
//! that fans envelopes out to a recipient's live connections.

mod dispatch;
mod handler;
mod hub;
mod types;

pub use handler::{RelaySettings, ws_handler};
pub use hub::{ConnId, Hub, HubConfig, HubHandle, OverflowPolicy, Registration};
pub use types::{
    DataType, Envelope, ErrorCode, ErrorPayload, InitPayload, MAX_THREAD_PAGE, ThreadQueryPayload,
};
