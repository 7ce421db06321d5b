//! Audit queries: the event log and the command log.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;
use kabin_core::events::EventFilter;
use kabin_core::types::{CommandLogEntry, Event, EventType};

// ── GET /api/events ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i64>,
    pub rfid_card: Option<String>,
    pub staff_user: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, AppError> {
    let filter = EventFilter {
        kiosk_id: query.kiosk_id,
        locker_id: query.locker_id,
        rfid_card: query.rfid_card,
        staff_user: query.staff_user,
        event_type: query.event_type,
        since: query.since,
        until: query.until,
        limit: query.limit,
    };
    Ok(Json(state.events.query(&filter).await?))
}

// ── GET /api/events/recent ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_tail")]
    pub n: i64,
}

fn default_tail() -> i64 {
    50
}

pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Event>>, AppError> {
    Ok(Json(state.events.recent(query.n).await?))
}

// ── GET /api/command-log ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CommandLogQuery {
    pub kiosk_id: String,
    #[serde(default = "default_tail")]
    pub limit: i64,
}

pub async fn command_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommandLogQuery>,
) -> Result<Json<Vec<CommandLogEntry>>, AppError> {
    Ok(Json(
        state.audit.command_log(&query.kiosk_id, query.limit).await?,
    ))
}
