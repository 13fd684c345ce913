use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::metrics;

pub mod instructor;
pub mod student;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "labsense-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
