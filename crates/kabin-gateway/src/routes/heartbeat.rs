//! Kiosk heartbeat route.

use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::middleware::KioskIdentity;
use crate::state::AppState;
use kabin_core::types::{EventDetail, EventType, NewEvent};

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub kiosk_id: String,
    pub version: String,
    pub config_hash: String,
    #[serde(default)]
    pub degraded: bool,
    /// Set on the first heartbeat after a kiosk boot; clears its queue.
    #[serde(default)]
    pub restarted: bool,
    pub restart_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub config_hash: String,
    pub commands_pending: i64,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(kiosk): Extension<KioskIdentity>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    if kiosk.kiosk_id != request.kiosk_id {
        return Err(AppError::Forbidden(
            "kiosk id does not match credentials".to_owned(),
        ));
    }

    if request.restarted {
        let cleared = state.queue.clear(&kiosk.kiosk_id).await?;
        let reason = request
            .restart_reason
            .clone()
            .unwrap_or_else(|| "unknown".to_owned());
        state
            .events
            .append(
                NewEvent::new(EventType::Restarted)
                    .kiosk(&kiosk.kiosk_id)
                    .details(EventDetail::Restarted {
                        cleared_commands: cleared,
                        reason: reason.clone(),
                    }),
            )
            .await?;
        info!(kiosk_id = %kiosk.kiosk_id, cleared, reason, "kiosk restarted");
    }

    state
        .heartbeats
        .ping(
            &kiosk.kiosk_id,
            &request.version,
            &request.config_hash,
            request.degraded,
        )
        .await?;

    Ok(Json(HeartbeatResponse {
        config_hash: state.system_config.hash().await,
        commands_pending: state.queue.pending_count(&kiosk.kiosk_id).await?,
    }))
}
