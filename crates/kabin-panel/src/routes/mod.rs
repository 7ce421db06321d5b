//! Panel route modules.

pub mod audit;
pub mod health;
pub mod kiosks;
pub mod lockers;
pub mod vip;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::staff_auth;
use crate::state::AppState;

/// Build the full panel router. Everything except `/health` requires a
/// staff identity.
pub fn router(state: Arc<AppState>) -> Router {
    let staff = Router::new()
        .route("/api/lockers", get(lockers::list))
        .route("/api/lockers/open", post(lockers::open))
        .route("/api/lockers/bulk-open", post(lockers::bulk_open))
        .route("/api/lockers/block", post(lockers::block))
        .route("/api/lockers/unblock", post(lockers::unblock))
        .route("/api/emergency/open-all", post(lockers::emergency_open_all))
        .route("/api/vip", get(vip::list).post(vip::create))
        .route("/api/vip/{id}/cancel", post(vip::cancel))
        .route("/api/events", get(audit::events))
        .route("/api/events/recent", get(audit::recent))
        .route("/api/command-log", get(audit::command_log))
        .route("/api/kiosks", get(kiosks::list))
        .layer(axum_mw::from_fn(staff_auth))
        // Bulk and emergency paths fan out into many queue writes; cap
        // how many staff requests run at once.
        .layer(tower::limit::ConcurrencyLimitLayer::new(32));

    // CORS for the panel UI's dev server.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-staff-user"),
            axum::http::HeaderName::from_static("x-staff-session"),
        ]);

    Router::new()
        .route("/health", get(health::health))
        .merge(staff)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
