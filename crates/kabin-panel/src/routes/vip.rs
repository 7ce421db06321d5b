//! VIP contract CRUD.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::StaffIdentity;
use crate::state::AppState;
use kabin_core::types::VipContract;
use kabin_core::vip::NewVipContract;

// ── GET /api/vip ─────────────────────────────────────────────────────

pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<VipContract>>, AppError> {
    Ok(Json(state.vip.list().await?))
}

// ── POST /api/vip ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub rfid_card: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<VipContract>, AppError> {
    let contract = state
        .vip
        .create(NewVipContract {
            kiosk_id: request.kiosk_id,
            locker_id: request.locker_id,
            rfid_card: request.rfid_card,
            start_date: request.start_date,
            end_date: request.end_date,
            created_by: staff.user.clone(),
        })
        .await?;

    state
        .audit
        .record(staff.action(
            "vip_create",
            "vip_contract",
            &contract.id.to_string(),
            serde_json::json!({
                "kiosk_id": contract.kiosk_id,
                "locker_id": contract.locker_id,
                "end_date": contract.end_date,
            }),
        ))
        .await?;

    Ok(Json(contract))
}

// ── POST /api/vip/{id}/cancel ────────────────────────────────────────

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Path(id): Path<Uuid>,
) -> Result<Json<VipContract>, AppError> {
    let contract = state.vip.cancel(id, &staff.user).await?;

    state
        .audit
        .record(staff.action(
            "vip_cancel",
            "vip_contract",
            &id.to_string(),
            serde_json::json!({
                "kiosk_id": contract.kiosk_id,
                "locker_id": contract.locker_id,
            }),
        ))
        .await?;

    Ok(Json(contract))
}
