//! Error types for `kabin-core`.
//!
//! Each domain area gets its own error enum, and each variant carries enough
//! context to diagnose the problem without a debugger. Domain errors are
//! returned as values — mapping onto HTTP status codes happens only at the
//! process boundaries (gateway, kiosk, panel).

use crate::types::{CommandStatus, LockerStatus};

/// Errors from locker state machine operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No such locker row.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' not found")]
    NotFound { kiosk_id: String, locker_id: i64 },

    /// Optimistic version check failed twice — a concurrent writer won.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is busy")]
    Busy { kiosk_id: String, locker_id: i64 },

    /// The locker is not in the status the operation requires.
    #[error("locker is {actual}, expected {expected}")]
    InvalidStatus {
        expected: &'static str,
        actual: LockerStatus,
    },

    /// The locker is bound to a VIP contract and excluded from this flow.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is a VIP locker")]
    VipBlocked { kiosk_id: String, locker_id: i64 },

    /// The locker has been disabled by the operator.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is disabled")]
    Disabled { kiosk_id: String, locker_id: i64 },

    /// The owner already holds a different locker.
    #[error("owner already holds locker {locker_id} on kiosk '{kiosk_id}'")]
    OwnerAlreadyHasLocker { kiosk_id: String, locker_id: i64 },

    /// Release was attempted with an owner key that does not match.
    #[error("caller does not own this locker")]
    NotOwner,

    /// VIP ownership is only dissolved by the contract lifecycle.
    #[error("locker is VIP-protected and cannot be released directly")]
    VipProtected,

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<EventError> for StateError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Storage(e) => Self::Storage(e),
        }
    }
}

/// Errors from the durable command queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No such command.
    #[error("command '{command_id}' not found")]
    NotFound { command_id: String },

    /// The command is not in a status that permits this transition.
    #[error("command '{command_id}' is {status}, cannot {operation}")]
    InvalidStatus {
        command_id: String,
        status: CommandStatus,
        operation: &'static str,
    },

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from the event log.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from the heartbeat manager.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// No heartbeat row for the kiosk — it was never provisioned.
    #[error("kiosk '{kiosk_id}' is not registered")]
    UnknownKiosk { kiosk_id: String },

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from configuration loading and mutation.
///
/// A failed mutation never replaces the current in-memory document — callers
/// see the error, the running configuration stays as it was.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed.
    #[error("config file I/O failed for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("config parse failed for '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Serializing the document for persistence failed.
    #[error("config serialization failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The document violates a structural rule.
    #[error("invalid configuration: {reason}")]
    Validation { reason: String },

    /// Two enabled zones claim the same locker id.
    #[error("zones '{zone_a}' and '{zone_b}' have overlapping ranges")]
    RangeOverlap { zone_a: String, zone_b: String },

    /// A zone references a relay card that is not declared in hardware.
    #[error("zone '{zone}' references unknown relay card {slave_address}")]
    UnknownRelayCard { zone: String, slave_address: u8 },
}

/// Errors from zone-aware hardware mapping.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// No configured zone covers this locker id.
    #[error("locker {locker_id} is not covered by any zone")]
    NotInZone { locker_id: i64 },

    /// The locker's position exceeds the zone's relay card capacity.
    #[error("locker {locker_id} exceeds zone capacity of {capacity}")]
    CapacityExceeded { locker_id: i64, capacity: u32 },

    /// The named zone does not exist or is disabled.
    #[error("unknown zone '{zone}'")]
    UnknownZone { zone: String },

    /// The locker exists but is outside the requested zone.
    #[error("locker {locker_id} is not in zone '{zone}'")]
    ZoneMismatch { zone: String, locker_id: i64 },
}

/// Errors from VIP contract management.
#[derive(Debug, thiserror::Error)]
pub enum VipError {
    /// No such contract.
    #[error("VIP contract '{id}' not found")]
    ContractNotFound { id: String },

    /// The contract is not active.
    #[error("VIP contract '{id}' is {status}")]
    NotActive { id: String, status: String },

    /// The card is already bound to another active contract.
    #[error("card '{rfid_card}' already has an active VIP contract")]
    CardAlreadyBound { rfid_card: String },

    /// The end date precedes the start date.
    #[error("contract end date precedes start date")]
    InvalidDates,

    /// The staff-entered card number failed normalization.
    #[error("invalid RFID card: {0}")]
    InvalidCard(#[from] UidError),

    /// Binding or clearing the locker failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from kiosk provisioning and authentication.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// The token does not exist.
    #[error("unknown provisioning token")]
    UnknownToken,

    /// The token's 30-minute window has passed.
    #[error("provisioning token expired")]
    TokenExpired,

    /// One-shot tokens cannot be redeemed twice.
    #[error("provisioning token already used")]
    TokenUsed,

    /// The kiosk has no heartbeat row.
    #[error("kiosk '{kiosk_id}' is not registered")]
    UnknownKiosk { kiosk_id: String },

    /// The hardware id does not match the one seen at registration.
    #[error("hardware id mismatch for kiosk '{kiosk_id}'")]
    HardwareMismatch { kiosk_id: String },

    /// The presented registration secret failed constant-time comparison.
    #[error("invalid registration secret for kiosk '{kiosk_id}'")]
    InvalidSecret { kiosk_id: String },

    /// The underlying store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Errors from QR action token validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QrTokenError {
    /// Not base64, or not the expected JSON inside.
    #[error("malformed action token")]
    InvalidEncoding,

    /// HMAC signature does not verify.
    #[error("action token signature mismatch")]
    SignatureMismatch,

    /// The 5-second TTL has passed.
    #[error("action token expired")]
    Expired,

    /// The token was minted for a different locker.
    #[error("action token is for locker {token_locker}, not {requested}")]
    LockerMismatch { token_locker: i64, requested: i64 },

    /// The token was minted for a different device.
    #[error("action token is bound to another device")]
    DeviceMismatch,
}

/// Errors from RFID card UID normalization.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UidError {
    /// Nothing left after trimming.
    #[error("empty card UID")]
    Empty,

    /// The UID contains a non-hex character.
    #[error("card UID contains invalid character '{0}'")]
    InvalidCharacter(char),

    /// Too few significant digits (all-zero UIDs land here).
    #[error("card UID too short: {significant} significant digits")]
    ShortUid { significant: usize },
}

/// A request was rejected by the sliding-window rate limiter.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("rate limit exceeded, retry after {retry_after_secs}s")]
pub struct RateLimited {
    /// Seconds until the oldest window entry falls out. Always ≥ 1.
    pub retry_after_secs: u64,
}

/// Classification of a hardware failure on the RS-485 bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareErrorKind {
    /// No response within the read deadline.
    Timeout,
    /// Response CRC did not match.
    CrcMismatch,
    /// Response was malformed or truncated.
    Framing,
    /// The slave returned a Modbus exception.
    BusException,
    /// The serial port could not be opened or was lost.
    PortUnavailable,
    /// The driver has entered degraded mode and is refusing work.
    Degraded,
}

impl HardwareErrorKind {
    /// Transient failures are retried by the serializer; fatal ones are not.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::CrcMismatch | Self::Framing)
    }
}

/// A hardware command failed after the serializer exhausted its retries.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("hardware error {kind:?} on slave {slave_address} channel {channel}")]
pub struct HardwareError {
    pub kind: HardwareErrorKind,
    pub slave_address: u8,
    pub channel: u16,
}
