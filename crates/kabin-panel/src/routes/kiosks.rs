//! Kiosk monitor.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;
use kabin_core::types::KioskHeartbeat;

// ── GET /api/kiosks ──────────────────────────────────────────────────

pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<KioskHeartbeat>>, AppError> {
    Ok(Json(state.heartbeats.list().await?))
}
