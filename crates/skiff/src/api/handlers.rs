//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::session::{SessionStatus, validate_session_id};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/sessions/{session_id}/status
///
/// Only reports on resident actors; it never spawns one.
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    validate_session_id(&session_id)?;
    let handle = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found(format!("no live session {session_id}")))?;
    let status = handle.status().await?;
    Ok(Json(status))
}
