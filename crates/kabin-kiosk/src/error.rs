//! HTTP error type for the kiosk's QR surface.
//!
//! Domain errors are mapped onto status codes here and nowhere else. Every
//! response body carries a stable machine-readable `error` code, a
//! user-facing message (Turkish first, this is what the lock page shows),
//! and a `trace_id` for correlating with logs.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use kabin_core::error::{HardwareError, QrTokenError, RateLimited, StateError, UidError};

use crate::flows::FlowError;

/// Application-level error returned from kiosk HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Malformed input.
    BadRequest { code: &'static str, message: String },
    /// Request refused (origin, ownership, or signature).
    Forbidden { code: &'static str, message: String },
    /// No such locker.
    NotFound(String),
    /// The locker is not in a state that allows this action.
    Conflict(String),
    /// VIP locker — the QR surface is closed for it.
    VipLocked,
    /// Sliding-window rate limit hit.
    RateLimited { retry_after_secs: u64 },
    /// Hardware is degraded or the pulse failed.
    Hardware(String),
    /// Anything else.
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
            Self::Forbidden { code, message } => (StatusCode::FORBIDDEN, code, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            Self::VipLocked => (
                StatusCode::LOCKED,
                "vip_locker",
                "VIP dolap. QR kapalı".to_owned(),
            ),
            Self::RateLimited { retry_after_secs } => {
                let body = ErrorBody {
                    error: "RATE_LIMIT",
                    message: "Çok fazla istek. Lütfen bekleyin.".to_owned(),
                    trace_id,
                };
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    axum::Json(body),
                )
                    .into_response();
            }
            Self::Hardware(message) => {
                error!(trace_id, message, "hardware failure surfaced to QR client");
                (StatusCode::SERVICE_UNAVAILABLE, "hardware_error", message)
            }
            Self::Internal(message) => {
                error!(trace_id, message, "internal error on QR surface");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Beklenmeyen bir hata oluştu".to_owned(),
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

impl From<RateLimited> for AppError {
    fn from(err: RateLimited) -> Self {
        Self::RateLimited {
            retry_after_secs: err.retry_after_secs,
        }
    }
}

impl From<QrTokenError> for AppError {
    fn from(err: QrTokenError) -> Self {
        match err {
            QrTokenError::InvalidEncoding => Self::BadRequest {
                code: "invalid_token",
                message: "Geçersiz istek".to_owned(),
            },
            QrTokenError::Expired => Self::BadRequest {
                code: "token_expired",
                message: "İşlem süresi doldu. Sayfayı yenileyin.".to_owned(),
            },
            QrTokenError::SignatureMismatch
            | QrTokenError::LockerMismatch { .. }
            | QrTokenError::DeviceMismatch => Self::Forbidden {
                code: "token_rejected",
                message: "İşlem doğrulanamadı".to_owned(),
            },
        }
    }
}

impl From<StateError> for AppError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { .. } => Self::NotFound("Dolap bulunamadı".to_owned()),
            StateError::VipBlocked { .. } | StateError::VipProtected => Self::VipLocked,
            StateError::NotOwner => Self::Forbidden {
                code: "not_owner",
                message: "Bu dolap bu cihaza ait değil".to_owned(),
            },
            StateError::OwnerAlreadyHasLocker { .. } => {
                Self::Conflict("Bu cihaza zaten bir dolap atanmış".to_owned())
            }
            StateError::Busy { .. }
            | StateError::InvalidStatus { .. }
            | StateError::Disabled { .. } => Self::Conflict("Dolap müsait değil".to_owned()),
            StateError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<HardwareError> for AppError {
    fn from(err: HardwareError) -> Self {
        Self::Hardware(format!("Dolap açılamadı: {err}"))
    }
}

impl From<UidError> for AppError {
    fn from(err: UidError) -> Self {
        let code = match err {
            UidError::ShortUid { .. } => "SHORT_UID",
            UidError::Empty | UidError::InvalidCharacter(_) => "INVALID_UID",
        };
        Self::BadRequest {
            code,
            message: "Kart okunamadı".to_owned(),
        }
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::InvalidUid(e) => e.into(),
            FlowError::NoSession => Self::Conflict("Oturum bulunamadı veya süresi doldu".to_owned()),
            FlowError::NotOffered { .. } => Self::Conflict("Dolap seçilemez".to_owned()),
            FlowError::State(e) => e.into(),
            FlowError::Hardware(e) => e.into(),
            FlowError::Zone(e) => Self::Conflict(e.to_string()),
            FlowError::Event(e) => Self::Internal(e.to_string()),
        }
    }
}
