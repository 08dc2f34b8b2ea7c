//! Plain HTTP handlers.

use axum::Json;
use serde_json::{Value, json};

/// Health check.
///
/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
