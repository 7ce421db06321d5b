//! Staff identity middleware.
//!
//! Authentication itself is a collaborator (the authenticating reverse
//! proxy); the panel trusts `X-Staff-User` and records the surrounding
//! request context for the audit trail.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Identity of an authenticated staff user.
#[derive(Debug, Clone)]
pub struct StaffIdentity {
    pub user: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

impl StaffIdentity {
    /// Build the audit action skeleton for this request.
    #[must_use]
    pub fn action(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> kabin_core::audit::StaffAction {
        kabin_core::audit::StaffAction {
            user: self.user.clone(),
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            details,
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Require a staff identity on every panel route.
pub async fn staff_auth(mut req: Request, next: Next) -> Response {
    let Some(user) = header(&req, "x-staff-user").map(str::to_owned) else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "unauthorized",
                "message": "missing staff identity",
            })),
        )
            .into_response();
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
