use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use confab_types::error::ChatError;

/// HTTP-facing error wrapper. Maps the engine taxonomy onto status codes and
/// a uniform `{ success: false, message }` body.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(ChatError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ChatError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ChatError::Permission(m) => (StatusCode::FORBIDDEN, m.clone()),
            ChatError::InvalidState(m) => (StatusCode::CONFLICT, m.clone()),
            ChatError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ChatError::Storage(e) => {
                error!("Storage error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

/// spawn_blocking join failures are runtime-level, not domain-level.
pub fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError(ChatError::Storage(anyhow::anyhow!(
        "blocking task failed: {e}"
    )))
}
