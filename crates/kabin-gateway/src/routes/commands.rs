//! Command bus routes: kiosk polling and the staff command API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::{KioskIdentity, StaffIdentity};
use crate::state::AppState;
use kabin_core::audit::StaffAction;
use kabin_core::commands::DEFAULT_MAX_RETRIES;
use kabin_core::types::{Command, CommandPayload};
use kabin_core::zone;

// ── GET /commands?kiosk_id (kiosk) ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub kiosk_id: String,
}

pub async fn poll(
    State(state): State<Arc<AppState>>,
    Extension(kiosk): Extension<KioskIdentity>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<Command>>, AppError> {
    if kiosk.kiosk_id != query.kiosk_id {
        return Err(AppError::Forbidden(
            "kiosk id does not match credentials".to_owned(),
        ));
    }

    let leased = state
        .queue
        .poll(
            &kiosk.kiosk_id,
            state.config.poll_batch,
            Duration::seconds(state.config.command_lease_secs),
        )
        .await?;
    Ok(Json(leased))
}

// ── POST /commands/{id}/complete and /fail (kiosk) ───────────────────

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Extension(_kiosk): Extension<KioskIdentity>,
    Path(command_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.queue.mark_complete(command_id).await?;
    Ok(Json(serde_json::json!({"status": "completed"})))
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

pub async fn fail(
    State(state): State<Arc<AppState>>,
    Extension(_kiosk): Extension<KioskIdentity>,
    Path(command_id): Path<Uuid>,
    Json(request): Json<FailRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let command = state.queue.mark_failed(command_id, &request.error).await?;
    Ok(Json(serde_json::json!({
        "status": command.status,
        "attempts": command.attempts,
    })))
}

// ── POST /api/command (staff) ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StaffCommandRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub kiosk_id: String,
    pub locker_id: Option<i64>,
    pub zone: Option<String>,
    pub reason: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StaffCommandResponse {
    pub command_id: Uuid,
}

pub async fn staff_command(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<StaffCommandRequest>,
) -> Result<Json<StaffCommandResponse>, AppError> {
    let need_locker = || {
        request.locker_id.ok_or(AppError::BadRequest {
            code: "missing_locker",
            message: "locker_id is required for this command".to_owned(),
            zone_context: None,
        })
    };

    let payload = match request.kind.as_str() {
        "open" => CommandPayload::OpenLocker {
            locker_id: need_locker()?,
            reason: request.reason.clone(),
        },
        "close" => CommandPayload::CloseLocker {
            locker_id: need_locker()?,
        },
        "reset" => CommandPayload::ResetLocker {
            locker_id: need_locker()?,
        },
        "buzzer" => CommandPayload::Buzzer {
            pattern: request.pattern.clone(),
        },
        other => {
            return Err(AppError::BadRequest {
                code: "unknown_command",
                message: format!("unknown command type '{other}'"),
                zone_context: None,
            })
        }
    };

    // A zone-scoped request must actually cover the target locker.
    if let (Some(zone_id), Some(locker_id)) = (&request.zone, payload.locker_id()) {
        let snapshot = state.system_config.snapshot().await;
        zone::require_locker_in_zone(&snapshot, zone_id, locker_id)?;
    }

    let command = state
        .queue
        .enqueue(&request.kiosk_id, payload, DEFAULT_MAX_RETRIES)
        .await?;

    state
        .audit
        .record(StaffAction {
            user: staff.user,
            action: format!("command_{}", request.kind),
            resource_type: "locker".to_owned(),
            resource_id: request
                .locker_id
                .map_or_else(|| request.kiosk_id.clone(), |id| id.to_string()),
            details: serde_json::json!({
                "kiosk_id": request.kiosk_id,
                "command_id": command.command_id,
                "reason": request.reason,
            }),
            ip: staff.ip,
            user_agent: staff.user_agent,
            session_id: staff.session_id,
        })
        .await?;

    Ok(Json(StaffCommandResponse {
        command_id: command.command_id,
    }))
}
