//! HTTP error type for the gateway.
//!
//! Maps domain errors from `kabin-core` onto status codes — the only place
//! that does. Validation failures carry a stable `error` code and, for
//! zone problems, the offending zone as `zone_context`. Every body gets a
//! `trace_id`; 5xx paths log it with full context.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use kabin_core::error::{
    EventError, HeartbeatError, ProvisioningError, QueueError, StateError, VipError, ZoneError,
};

/// Application-level error returned from gateway HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Malformed input, including unknown zones.
    BadRequest {
        code: &'static str,
        message: String,
        zone_context: Option<String>,
    },
    /// Semantically invalid, e.g. a locker outside the requested zone.
    Unprocessable {
        code: &'static str,
        message: String,
        zone_context: Option<String>,
    },
    /// Kiosk or staff authentication failed.
    Unauthorized(String),
    /// Authenticated but not allowed.
    Forbidden(String),
    /// No such resource.
    NotFound(String),
    /// The resource is not in a state that allows the operation.
    Conflict(String),
    /// Internal failure.
    Internal(String),
}

impl AppError {
    /// Unknown-zone validation failure (HTTP 400, `INVALID_ZONE`).
    #[must_use]
    pub fn invalid_zone(zone: &str) -> Self {
        Self::BadRequest {
            code: "INVALID_ZONE",
            message: format!("unknown zone '{zone}'"),
            zone_context: Some(zone.to_owned()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone_context: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let (status, code, message, zone_context) = match self {
            Self::BadRequest {
                code,
                message,
                zone_context,
            } => (StatusCode::BAD_REQUEST, code, message, zone_context),
            Self::Unprocessable {
                code,
                message,
                zone_context,
            } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                code,
                message,
                zone_context,
            ),
            Self::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", message, None)
            }
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, "forbidden", message, None),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message, None),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message, None),
            Self::Internal(message) => {
                error!(trace_id, message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: code,
            message,
            trace_id,
            zone_context,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<ZoneError> for AppError {
    fn from(err: ZoneError) -> Self {
        match err {
            ZoneError::UnknownZone { zone } => Self::invalid_zone(&zone),
            ZoneError::ZoneMismatch { zone, locker_id } => Self::Unprocessable {
                code: "LOCKER_ZONE_MISMATCH",
                message: format!("locker {locker_id} is not in zone '{zone}'"),
                zone_context: Some(zone),
            },
            ZoneError::NotInZone { locker_id } => Self::Unprocessable {
                code: "LOCKER_NOT_IN_ZONE",
                message: format!("locker {locker_id} is not covered by any zone"),
                zone_context: None,
            },
            ZoneError::CapacityExceeded { locker_id, capacity } => Self::Unprocessable {
                code: "ZONE_CAPACITY_EXCEEDED",
                message: format!("locker {locker_id} exceeds zone capacity {capacity}"),
                zone_context: None,
            },
        }
    }
}

impl From<StateError> for AppError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { .. } => Self::NotFound(err.to_string()),
            StateError::Busy { .. }
            | StateError::InvalidStatus { .. }
            | StateError::OwnerAlreadyHasLocker { .. }
            | StateError::Disabled { .. } => Self::Conflict(err.to_string()),
            StateError::VipBlocked { .. } | StateError::VipProtected | StateError::NotOwner => {
                Self::Unprocessable {
                    code: "STATE_PRECONDITION",
                    message: err.to_string(),
                    zone_context: None,
                }
            }
            StateError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound { .. } => Self::NotFound(err.to_string()),
            QueueError::InvalidStatus { .. } => Self::Conflict(err.to_string()),
            QueueError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::UnknownKiosk { .. } => Self::Unauthorized(err.to_string()),
            HeartbeatError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ProvisioningError> for AppError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::UnknownToken
            | ProvisioningError::TokenExpired
            | ProvisioningError::TokenUsed => Self::BadRequest {
                code: "invalid_token",
                message: err.to_string(),
                zone_context: None,
            },
            ProvisioningError::UnknownKiosk { .. }
            | ProvisioningError::HardwareMismatch { .. }
            | ProvisioningError::InvalidSecret { .. } => Self::Unauthorized(err.to_string()),
            ProvisioningError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<VipError> for AppError {
    fn from(err: VipError) -> Self {
        match err {
            VipError::ContractNotFound { .. } => Self::NotFound(err.to_string()),
            VipError::NotActive { .. } | VipError::CardAlreadyBound { .. } => {
                Self::Conflict(err.to_string())
            }
            VipError::InvalidDates | VipError::InvalidCard(_) => Self::BadRequest {
                code: "invalid_contract",
                message: err.to_string(),
                zone_context: None,
            },
            VipError::State(e) => e.into(),
            VipError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<EventError> for AppError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}
