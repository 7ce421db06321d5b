//! Locker read models and the staff open path.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::StaffIdentity;
use crate::state::AppState;
use kabin_core::audit::StaffAction;
use kabin_core::commands::DEFAULT_MAX_RETRIES;
use kabin_core::types::{CommandPayload, EventType, Locker, NewEvent};
use kabin_core::zone;

#[derive(Debug, Deserialize)]
pub struct LockersQuery {
    pub kiosk_id: String,
    pub zone: Option<String>,
}

// ── GET /api/lockers/available ───────────────────────────────────────

pub async fn available(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LockersQuery>,
) -> Result<Json<Vec<Locker>>, AppError> {
    let snapshot = state.system_config.snapshot().await;
    let zone = match &query.zone {
        Some(zone_id) => Some(zone::require_zone(&snapshot, zone_id)?),
        None => None,
    };
    let lockers = state.state.available(&query.kiosk_id, zone).await?;
    Ok(Json(lockers))
}

// ── GET /api/lockers/all ─────────────────────────────────────────────

pub async fn all(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LockersQuery>,
) -> Result<Json<Vec<Locker>>, AppError> {
    let snapshot = state.system_config.snapshot().await;
    let lockers = state.state.all(&query.kiosk_id).await?;

    let lockers = match &query.zone {
        Some(zone_id) => {
            let zone = zone::require_zone(&snapshot, zone_id)?;
            lockers
                .into_iter()
                .filter(|l| zone.contains(l.locker_id))
                .collect()
        }
        None => lockers,
    };
    Ok(Json(lockers))
}

// ── POST /api/locker/open (staff) ────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    pub zone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub reason: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct OpenResponse {
    pub command_id: Uuid,
}

/// Enqueue a staff open. Never mutates ownership — the kiosk executes the
/// pulse and the locker stays with whoever holds it.
pub async fn staff_open(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Query(query): Query<OpenQuery>,
    Json(request): Json<OpenRequest>,
) -> Result<Json<OpenResponse>, AppError> {
    if let Some(zone_id) = &query.zone {
        let snapshot = state.system_config.snapshot().await;
        zone::require_locker_in_zone(&snapshot, zone_id, request.locker_id)?;
    }

    // Fails early when the locker does not exist at all.
    state.state.get(&request.kiosk_id, request.locker_id).await?;

    let command = state
        .queue
        .enqueue(
            &request.kiosk_id,
            CommandPayload::OpenLocker {
                locker_id: request.locker_id,
                reason: request.reason.clone(),
            },
            DEFAULT_MAX_RETRIES,
        )
        .await?;

    state
        .events
        .append(
            NewEvent::new(EventType::StaffOpen)
                .kiosk(&request.kiosk_id)
                .locker(request.locker_id)
                .staff(&staff.user),
        )
        .await?;
    state
        .audit
        .record(StaffAction {
            user: staff.user,
            action: "locker_open".to_owned(),
            resource_type: "locker".to_owned(),
            resource_id: request.locker_id.to_string(),
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

    Ok(Json(OpenResponse {
        command_id: command.command_id,
    }))
}
