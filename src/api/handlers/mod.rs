//! API request handlers

pub mod instances;
pub mod proxy;
pub mod stream;
pub mod torrents;

use axum::Json;
use serde_json::json;

/// Health check endpoint
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
