//! HTTP surface: the health endpoint and the WebSocket upgrade route.

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
