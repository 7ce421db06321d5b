//! Staff locker operations: monitor, open, bulk open, block, emergency.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::StaffIdentity;
use crate::state::AppState;
use kabin_core::commands::DEFAULT_MAX_RETRIES;
use kabin_core::state::Actor;
use kabin_core::types::{
    CommandPayload, EventDetail, EventType, Locker, LockerStatus, NewEvent,
};
use kabin_core::zone;

// ── GET /api/lockers ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub kiosk_id: String,
    pub zone: Option<String>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Locker>>, AppError> {
    let lockers = state.state.all(&query.kiosk_id).await?;
    let lockers = match &query.zone {
        Some(zone_id) => {
            let snapshot = state.system_config.snapshot().await;
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

// ── POST /api/lockers/open ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OpenResponse {
    pub command_id: Uuid,
}

pub async fn open(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<OpenRequest>,
) -> Result<Json<OpenResponse>, AppError> {
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
        .record(staff.action(
            "locker_open",
            "locker",
            &request.locker_id.to_string(),
            serde_json::json!({
                "kiosk_id": request.kiosk_id,
                "command_id": command.command_id,
                "reason": request.reason,
            }),
        ))
        .await?;

    Ok(Json(OpenResponse {
        command_id: command.command_id,
    }))
}

// ── POST /api/lockers/bulk-open ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BulkOpenRequest {
    pub kiosk_id: String,
    pub locker_ids: Vec<i64>,
    #[serde(default = "default_true")]
    pub exclude_vip: bool,
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct BulkOpenResponse {
    pub enqueued: u64,
    pub excluded_vip: u64,
    pub command_ids: Vec<Uuid>,
}

/// Expand a bulk open into individual `open_locker` commands, skipping
/// VIP lockers unless told otherwise. All commands and the `bulk_open`
/// event commit in one transaction.
pub async fn bulk_open(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<BulkOpenRequest>,
) -> Result<Json<BulkOpenResponse>, AppError> {
    let mut excluded = 0u64;
    let mut targets = Vec::with_capacity(request.locker_ids.len());
    for &locker_id in &request.locker_ids {
        let locker = state.state.get(&request.kiosk_id, locker_id).await?;
        if request.exclude_vip && locker.is_vip {
            excluded += 1;
            continue;
        }
        targets.push(locker_id);
    }

    let mut tx = state
        .db
        .pool()
        .begin()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let mut command_ids = Vec::with_capacity(targets.len());
    for locker_id in &targets {
        let command = state
            .queue
            .enqueue_in(
                &mut *tx,
                &request.kiosk_id,
                CommandPayload::OpenLocker {
                    locker_id: *locker_id,
                    reason: request.reason.clone(),
                },
                DEFAULT_MAX_RETRIES,
            )
            .await?;
        command_ids.push(command.command_id);
    }
    let event = state
        .events
        .append_in(
            &mut *tx,
            NewEvent::new(EventType::BulkOpen)
                .kiosk(&request.kiosk_id)
                .staff(&staff.user)
                .details(EventDetail::BulkOpen {
                    requested: request.locker_ids.len() as u64,
                    enqueued: targets.len() as u64,
                    excluded_vip: excluded,
                }),
        )
        .await?;
    tx.commit()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    state.events.publish(&event);

    state
        .audit
        .record(staff.action(
            "bulk_open",
            "kiosk",
            &request.kiosk_id,
            serde_json::json!({
                "locker_ids": request.locker_ids,
                "exclude_vip": request.exclude_vip,
                "reason": request.reason,
            }),
        ))
        .await?;

    info!(kiosk_id = %request.kiosk_id, enqueued = targets.len(), excluded, "bulk open");
    Ok(Json(BulkOpenResponse {
        enqueued: targets.len() as u64,
        excluded_vip: excluded,
        command_ids,
    }))
}

// ── POST /api/lockers/block and /unblock ─────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub reason: String,
}

pub async fn block(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<BlockRequest>,
) -> Result<Json<Locker>, AppError> {
    let (locker, _command) = state
        .state
        .block_with_close(
            &request.kiosk_id,
            request.locker_id,
            &request.reason,
            Actor::staff(&staff.user),
            &state.queue,
        )
        .await?;

    state
        .audit
        .record(staff.action(
            "locker_block",
            "locker",
            &request.locker_id.to_string(),
            serde_json::json!({"kiosk_id": request.kiosk_id, "reason": request.reason}),
        ))
        .await?;

    Ok(Json(locker))
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
}

pub async fn unblock(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<UnblockRequest>,
) -> Result<Json<Locker>, AppError> {
    let locker = state
        .state
        .unblock(
            &request.kiosk_id,
            request.locker_id,
            Actor::staff(&staff.user),
        )
        .await?;

    state
        .audit
        .record(staff.action(
            "locker_unblock",
            "locker",
            &request.locker_id.to_string(),
            serde_json::json!({"kiosk_id": request.kiosk_id}),
        ))
        .await?;

    Ok(Json(locker))
}

// ── POST /api/emergency/open-all ─────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EmergencyRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct EmergencyResponse {
    pub kiosks: u64,
    pub lockers: u64,
}

/// Open every owned locker on every online kiosk. Gated behind
/// `features.emergency_open_enabled` in the configuration document.
pub async fn emergency_open_all(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<EmergencyRequest>,
) -> Result<Json<EmergencyResponse>, AppError> {
    let snapshot = state.system_config.snapshot().await;
    if !snapshot.features.emergency_open_enabled {
        return Err(AppError::Forbidden(
            "emergency open is disabled in configuration".to_owned(),
        ));
    }

    let mut kiosks = 0u64;
    let mut lockers = 0u64;
    for kiosk in state.heartbeats.online().await? {
        let mut opened_here = 0u64;
        for locker in state.state.all(&kiosk.kiosk_id).await? {
            if locker.status != LockerStatus::Owned {
                continue;
            }
            state
                .queue
                .enqueue(
                    &kiosk.kiosk_id,
                    CommandPayload::OpenLocker {
                        locker_id: locker.locker_id,
                        reason: Some(request.reason.clone()),
                    },
                    DEFAULT_MAX_RETRIES,
                )
                .await?;
            opened_here += 1;
        }
        if opened_here > 0 {
            kiosks += 1;
            lockers += opened_here;
        }
    }

    state
        .events
        .append(
            NewEvent::new(EventType::EmergencyOpen)
                .staff(&staff.user)
                .details(EventDetail::EmergencyOpen { kiosks, lockers }),
        )
        .await?;
    state
        .audit
        .record(staff.action(
            "emergency_open_all",
            "system",
            "all",
            serde_json::json!({"reason": request.reason, "kiosks": kiosks, "lockers": lockers}),
        ))
        .await?;

    warn!(user = %staff.user, kiosks, lockers, reason = %request.reason, "emergency open all");
    Ok(Json(EmergencyResponse { kiosks, lockers }))
}
