use axum::{
    extract::{FromRequest, FromRequestParts, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Custom JSON extractor that returns JSON error responses instead of HTML
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                let message = format!("Failed to parse JSON request body: {}", rejection);
                tracing::warn!("{}", message);
                let error_response = json!({
                    "message": message,
                    "status": 400
                });
                Err((StatusCode::BAD_REQUEST, Json(error_response)).into_response())
            }
        }
    }
}

/// Authenticated student identity, injected by the gateway as headers. The
/// engine performs no credential checks of its own; a request without the
/// identity header never got past the gateway in a real deployment.
#[derive(Debug, Clone)]
pub struct StudentIdentity {
    pub student_id: String,
}

impl<S> FromRequestParts<S> for StudentIdentity
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let student_id = parts
            .headers
            .get("x-student-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match student_id {
            Some(id) => Ok(StudentIdentity {
                student_id: id.to_string(),
            }),
            None => {
                let error_response = json!({
                    "message": "missing student identity",
                    "status": 401
                });
                Err((StatusCode::UNAUTHORIZED, Json(error_response)).into_response())
            }
        }
    }
}
