use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;

use confab_types::api::{Ack, Claims};
use confab_types::error::ChatError;

use crate::error::{join_error, ApiError};
use crate::state::AppState;

/// 30-day ceiling keeps the expiry horizon bounded.
const MAX_RETENTION_HOURS: i64 = 24 * 30;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionRequest {
    pub hours: i64,
}

/// PUT /settings/retention — per-user message lifetime.
///
/// Applies to messages sent from now on: `expires_at` is materialized at
/// send time, so already-sent messages keep their original expiry.
pub async fn update_retention(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RetentionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.hours < 1 || req.hours > MAX_RETENTION_HOURS {
        return Err(ChatError::Validation(format!(
            "retention must be between 1 and {} hours",
            MAX_RETENTION_HOURS
        ))
        .into());
    }

    let db = state.db.clone();
    let me = claims.sub;
    let hours = req.hours;
    tokio::task::spawn_blocking(move || db.set_retention_hours(me, hours))
        .await
        .map_err(join_error)?
        .map_err(ChatError::Storage)?;

    Ok(Json(Ack::ok(format!("retention set to {} hours", req.hours))))
}
