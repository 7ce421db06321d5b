//! Gateway health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::{AppState, VERSION};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub zone_info: Vec<ZoneInfo>,
    pub database: DatabaseHealth,
    pub uptime_secs: u64,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ZoneInfo {
    pub id: String,
    pub enabled: bool,
    pub covered: i64,
    pub capacity: u32,
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub status: &'static str,
    pub last_write: Option<DateTime<Utc>>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = state.db.healthy().await;
    let snapshot = state.system_config.snapshot().await;

    Json(HealthResponse {
        status: if db_ok { "ok" } else { "error" },
        zone_info: snapshot
            .zones
            .iter()
            .map(|z| ZoneInfo {
                id: z.id.clone(),
                enabled: z.enabled,
                covered: z.covered(),
                capacity: z.capacity(),
            })
            .collect(),
        database: DatabaseHealth {
            status: if db_ok { "ok" } else { "error" },
            last_write: state.db.last_write().await.ok().flatten(),
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: VERSION,
    })
}
