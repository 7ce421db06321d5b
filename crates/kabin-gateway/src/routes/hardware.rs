//! Hardware registration: new relay cards and automatic zone extension.

use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::middleware::StaffIdentity;
use crate::state::AppState;
use kabin_core::audit::StaffAction;
use kabin_core::config::{LockerRange, RelayCard, CHANNELS_PER_CARD};
use kabin_core::types::{EventDetail, EventType, NewEvent};

#[derive(Debug, Deserialize)]
pub struct NewRelayCard {
    pub slave_address: u8,
    #[serde(default, rename = "type")]
    pub card_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterCardsRequest {
    pub cards: Vec<NewRelayCard>,
}

#[derive(Debug, Serialize)]
pub struct RegisterCardsResponse {
    pub total_capacity: u32,
    pub extended_zone: Option<String>,
    pub new_ranges: Option<Vec<LockerRange>>,
}

/// Register relay cards. When zones are enabled the last enabled zone is
/// extended to cover the added capacity; a validation failure rolls the
/// whole change back and leaves an error event behind.
pub async fn register_cards(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffIdentity>,
    Json(request): Json<RegisterCardsRequest>,
) -> Result<Json<RegisterCardsResponse>, AppError> {
    let cards: Vec<RelayCard> = request
        .cards
        .into_iter()
        .map(|c| RelayCard {
            slave_address: c.slave_address,
            channels: CHANNELS_PER_CARD,
            card_type: c.card_type,
            description: c.description,
            enabled: true,
        })
        .collect();

    let extension = match state.system_config.register_relay_cards(cards).await {
        Ok(extension) => extension,
        Err(err) => {
            warn!(error = %err, "zone extension rejected");
            state
                .events
                .append(
                    NewEvent::new(EventType::ZoneExtensionFailed).details(
                        EventDetail::ZoneExtensionFailed {
                            reason: err.to_string(),
                        },
                    ),
                )
                .await?;
            return Err(AppError::BadRequest {
                code: "invalid_hardware_config",
                message: err.to_string(),
                zone_context: None,
            });
        }
    };

    let snapshot = state.system_config.snapshot().await;
    let capacity = snapshot.total_capacity();

    if let Some(extension) = &extension {
        state
            .events
            .append(
                NewEvent::new(EventType::ZoneExtended).details(EventDetail::ZoneExtended {
                    zone: extension.zone.clone(),
                    added_cards: extension.added_cards.clone(),
                    ranges: extension.ranges.clone(),
                }),
            )
            .await?;
    }
    state
        .events
        .append(
            NewEvent::new(EventType::ConfigUpdated).details(EventDetail::ConfigUpdated {
                config_version: snapshot.config_version,
                config_hash: state.system_config.hash().await,
            }),
        )
        .await?;

    // Grow every known kiosk's locker table to the new capacity.
    for kiosk in state.heartbeats.list().await? {
        state
            .state
            .ensure_lockers(&kiosk.kiosk_id, i64::from(capacity), &snapshot)
            .await?;
    }

    state
        .audit
        .record(StaffAction {
            user: staff.user,
            action: "register_relay_cards".to_owned(),
            resource_type: "hardware".to_owned(),
            resource_id: "relay_cards".to_owned(),
            details: serde_json::json!({
                "total_capacity": capacity,
                "extended_zone": extension.as_ref().map(|e| e.zone.clone()),
            }),
            ip: staff.ip,
            user_agent: staff.user_agent,
            session_id: staff.session_id,
        })
        .await?;

    Ok(Json(RegisterCardsResponse {
        total_capacity: capacity,
        extended_zone: extension.as_ref().map(|e| e.zone.clone()),
        new_ranges: extension.map(|e| e.ranges),
    }))
}
