//! Liveness endpoints.

use axum::Json;
use chrono::{SecondsFormat, Utc};

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "jawabu server is running",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}
