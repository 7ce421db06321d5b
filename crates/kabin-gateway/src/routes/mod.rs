//! Gateway route modules.

pub mod commands;
pub mod hardware;
pub mod health;
pub mod heartbeat;
pub mod lockers;
pub mod provisioning;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{kiosk_auth, staff_auth};
use crate::state::AppState;

/// Build the full gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let kiosk = Router::new()
        .route("/heartbeat", post(heartbeat::heartbeat))
        .route("/commands", get(commands::poll))
        .route("/commands/{id}/complete", post(commands::complete))
        .route("/commands/{id}/fail", post(commands::fail))
        .route("/provisioning/complete", post(provisioning::complete))
        .layer(axum_mw::from_fn_with_state(Arc::clone(&state), kiosk_auth));

    let staff = Router::new()
        .route("/provisioning/tokens", post(provisioning::issue_token))
        .route("/api/command", post(commands::staff_command))
        .route("/api/locker/open", post(lockers::staff_open))
        .route("/api/hardware/relay-cards", post(hardware::register_cards))
        .layer(axum_mw::from_fn(staff_auth));

    // Concurrency-limit the unauthenticated registration endpoint so a
    // misbehaving installer cannot exhaust the pool.
    let register = Router::new()
        .route("/provisioning/register", post(provisioning::register))
        .layer(tower::limit::ConcurrencyLimitLayer::new(10));

    // CORS — restrictive defaults for the staff panel's browser calls.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-staff-user"),
            axum::http::HeaderName::from_static("x-staff-session"),
        ]);

    Router::new()
        .route("/api/lockers/available", get(lockers::available))
        .route("/api/lockers/all", get(lockers::all))
        .route("/health", get(health::health))
        .merge(register)
        .merge(kiosk)
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
