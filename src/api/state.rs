//! Shared application state.

use std::sync::Arc;

use crate::messaging::MessagingService;
use crate::ws::{HubHandle, RelaySettings};

/// Everything handlers need, cloned per request by axum.
#[derive(Clone)]
pub struct AppState {
    pub messaging: Arc<MessagingService>,
    pub hub: HubHandle,
    pub relay: RelaySettings,
}

impl AppState {
    pub fn new(messaging: Arc<MessagingService>, hub: HubHandle, relay: RelaySettings) -> Self {
        Self {
            messaging,
            hub,
            relay,
        }
    }
}
