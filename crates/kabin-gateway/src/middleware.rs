//! Authentication middleware.
//!
//! Kiosk requests carry `X-Kiosk-Id`, `X-Kiosk-Secret`, and
//! `X-Hardware-Id`; the secret is re-derived and compared constant-time,
//! and the hardware id must match the one seen at registration. Staff
//! identity arrives as `X-Staff-User` from the authenticating reverse
//! proxy (staff authentication itself is a collaborator, not part of this
//! core) — handlers audit every staff operation under that name.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::state::AppState;

/// Identity of an authenticated kiosk, injected into request extensions.
#[derive(Debug, Clone)]
pub struct KioskIdentity {
    pub kiosk_id: String,
    pub hardware_id: String,
}

/// Identity of an authenticated staff user.
#[derive(Debug, Clone)]
pub struct StaffIdentity {
    pub user: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Middleware validating kiosk credentials on the kiosk-facing routes.
pub async fn kiosk_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let (Some(kiosk_id), Some(secret), Some(hardware_id)) = (
        header(&req, "x-kiosk-id").map(str::to_owned),
        header(&req, "x-kiosk-secret").map(str::to_owned),
        header(&req, "x-hardware-id").map(str::to_owned),
    ) else {
        return unauthorized("missing kiosk credentials");
    };

    if let Err(err) = state
        .provisioner
        .verify(&kiosk_id, &hardware_id, &secret)
        .await
    {
        warn!(kiosk_id, error = %err, "kiosk authentication failed");
        return unauthorized("invalid kiosk credentials");
    }

    req.extensions_mut().insert(KioskIdentity {
        kiosk_id,
        hardware_id,
    });
    next.run(req).await
}

/// Middleware requiring a staff identity on the admin routes.
pub async fn staff_auth(mut req: Request, next: Next) -> Response {
    let Some(user) = header(&req, "x-staff-user").map(str::to_owned) else {
        return unauthorized("missing staff identity");
    };

    let identity = StaffIdentity {
        user,
        ip: header(&req, "x-forwarded-for").map(str::to_owned),
        user_agent: header(&req, "user-agent").map(str::to_owned),
        session_id: header(&req, "x-staff-session").map(str::to_owned),
    };
    req.extensions_mut().insert(identity);
    next.run(req).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"error": "unauthorized", "message": message})),
    )
        .into_response()
}
