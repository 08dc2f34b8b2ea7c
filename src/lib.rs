//! Courier library.
//!
//! Relays chat messages between authenticated users over persistent
//! WebSocket connections, grouping exchanges into deduplicated two-party
//! threads persisted in SQLite.

pub mod api;
pub mod auth;
pub mod db;
pub mod messaging;
pub mod ws;
