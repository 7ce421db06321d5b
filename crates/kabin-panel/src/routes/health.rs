//! Panel health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::{AppState, VERSION};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: DatabaseHealth,
    pub uptime_secs: u64,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub status: &'static str,
    pub last_write: Option<DateTime<Utc>>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = state.db.healthy().await;
    Json(HealthResponse {
        status: if db_ok { "ok" } else { "error" },
        database: DatabaseHealth {
            status: if db_ok { "ok" } else { "error" },
            last_write: state.db.last_write().await.ok().flatten(),
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: VERSION,
    })
}
