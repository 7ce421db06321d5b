//! HTTP error type for the staff panel.
//!
//! Same mapping discipline as the gateway: domain errors become status
//! codes here only, every body carries a `trace_id`, and 5xx paths log
//! with context.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use kabin_core::error::{
    EventError, HeartbeatError, QueueError, StateError, VipError, ZoneError,
};

/// Application-level error returned from panel HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    BadRequest { code: &'static str, message: String },
    Unprocessable { code: &'static str, message: String },
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    trace_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let (status, code, message) = match self {
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::Unprocessable { code, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, code, message)
            }
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, "forbidden", message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            Self::Internal(message) => {
                error!(trace_id, message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: code,
            message,
            trace_id,
        };
        (status, axum::Json(body)).into_response()
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
                }
            }
            StateError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ZoneError> for AppError {
    fn from(err: ZoneError) -> Self {
        match err {
            ZoneError::UnknownZone { .. } => Self::BadRequest {
                code: "INVALID_ZONE",
                message: err.to_string(),
            },
            ZoneError::ZoneMismatch { .. } => Self::Unprocessable {
                code: "LOCKER_ZONE_MISMATCH",
                message: err.to_string(),
            },
            ZoneError::NotInZone { .. } | ZoneError::CapacityExceeded { .. } => {
                Self::Unprocessable {
                    code: "LOCKER_NOT_IN_ZONE",
                    message: err.to_string(),
                }
            }
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
            },
            VipError::State(e) => e.into(),
            VipError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::UnknownKiosk { .. } => Self::NotFound(err.to_string()),
            HeartbeatError::Storage(e) => Self::Internal(e.to_string()),
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
