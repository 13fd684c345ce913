use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error surface of the session engine. Policy violations carry the exact
/// message shown to the student; everything else maps to generic HTTP
/// failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    PolicyViolation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::PolicyViolation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::ParseError(_) | EngineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "message": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}
