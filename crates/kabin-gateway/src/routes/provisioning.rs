//! Provisioning routes: token issue, kiosk registration, enrollment.

use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::middleware::{KioskIdentity, StaffIdentity};
use crate::state::AppState;
use kabin_core::audit::StaffAction;
use kabin_core::zone;

// ── POST /provisioning/tokens (staff) ────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub zone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
    pub kiosk_id: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, AppError> {
    if let Some(zone_id) = &request.zone {
        let snapshot = state.system_config.snapshot().await;
        zone::require_zone(&snapshot, zone_id)?;
    }

    let token = state.provisioner.issue(request.zone.as_deref()).await?;

    state
        .audit
        .record(StaffAction {
            user: staff.user,
            action: "issue_provisioning_token".to_owned(),
            resource_type: "kiosk".to_owned(),
            resource_id: token.kiosk_id.clone(),
            details: serde_json::json!({"zone": token.zone}),
            ip: staff.ip,
            user_agent: staff.user_agent,
            session_id: staff.session_id,
        })
        .await?;

    Ok(Json(IssueTokenResponse {
        token: token.token,
        kiosk_id: token.kiosk_id,
        expires_at: token.expires_at,
    }))
}

// ── POST /provisioning/register (kiosk, pre-auth) ────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub hardware_id: String,
    pub zone: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub kiosk_id: String,
    pub registration_secret: String,
    pub panel_url: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let registration = state
        .provisioner
        .redeem(
            &request.token,
            &request.hardware_id,
            request.zone.as_deref(),
            request.version.as_deref(),
        )
        .await?;

    Ok(Json(RegisterResponse {
        kiosk_id: registration.kiosk_id,
        registration_secret: registration.registration_secret,
        panel_url: state.config.panel_url.clone(),
    }))
}

// ── POST /provisioning/complete (kiosk) ──────────────────────────────

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub kiosk_id: String,
    pub status: &'static str,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Extension(kiosk): Extension<KioskIdentity>,
) -> Result<Json<CompleteResponse>, AppError> {
    state.provisioner.complete_enrollment(&kiosk.kiosk_id).await?;

    // A freshly enrolled kiosk gets its locker rows immediately.
    let snapshot = state.system_config.snapshot().await;
    let capacity = i64::from(snapshot.total_capacity());
    if capacity > 0 {
        state
            .state
            .ensure_lockers(&kiosk.kiosk_id, capacity, &snapshot)
            .await?;
    }

    Ok(Json(CompleteResponse {
        kiosk_id: kiosk.kiosk_id,
        status: "online",
    }))
}
