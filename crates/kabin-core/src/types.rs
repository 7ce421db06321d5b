//! Domain types shared across the Kabin processes.
//!
//! Enums are closed sets persisted as snake_case text; command payloads and
//! event details are tagged unions with one canonical serialization. Unknown
//! event details read back as opaque JSON so old binaries can replay a log
//! written by newer ones, but code cannot construct new unknown variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::config::LockerRange;
use crate::error::HardwareErrorKind;

// ── Locker ───────────────────────────────────────────────────────────

/// Lifecycle status of a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LockerStatus {
    Free,
    Reserved,
    Owned,
    Opening,
    Blocked,
}

impl LockerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Owned => "owned",
            Self::Opening => "opening",
            Self::Blocked => "blocked",
        }
    }

    /// Statuses in which the locker carries owner fields.
    #[must_use]
    pub fn has_owner(self) -> bool {
        matches!(self, Self::Reserved | Self::Owned | Self::Opening)
    }
}

impl std::fmt::Display for LockerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who holds a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OwnerType {
    None,
    Rfid,
    Device,
    Vip,
}

impl OwnerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rfid => "rfid",
            Self::Device => "device",
            Self::Vip => "vip",
        }
    }
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One locker row — the single source of truth for that physical door.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Locker {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub status: LockerStatus,
    pub owner_type: OwnerType,
    pub owner_key: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub owned_at: Option<DateTime<Utc>>,
    /// Incremented on every mutation; the optimistic concurrency handle.
    pub version: i64,
    /// VIP lockers are excluded from free-selection pools.
    pub is_vip: bool,
    pub enabled: bool,
    pub display_name: Option<String>,
}

impl Locker {
    /// Operator label, falling back to the conventional "Dolap N".
    #[must_use]
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("Dolap {}", self.locker_id))
    }
}

/// Published on the abstract change channel after every committed mutation.
#[derive(Debug, Clone, Serialize)]
pub struct StateChanged {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub old: LockerStatus,
    pub new: LockerStatus,
    pub version: i64,
}

// ── Commands ─────────────────────────────────────────────────────────

/// Command discriminator, mirrored from the payload for query convenience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandKind {
    OpenLocker,
    CloseLocker,
    BulkOpen,
    BlockLocker,
    UnblockLocker,
    ResetLocker,
    Buzzer,
}

impl CommandKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenLocker => "open_locker",
            Self::CloseLocker => "close_locker",
            Self::BulkOpen => "bulk_open",
            Self::BlockLocker => "block_locker",
            Self::UnblockLocker => "unblock_locker",
            Self::ResetLocker => "reset_locker",
            Self::Buzzer => "buzzer",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed command payload — the closed set of instructions a kiosk executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    OpenLocker {
        locker_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CloseLocker {
        locker_id: i64,
    },
    BulkOpen {
        locker_ids: Vec<i64>,
        exclude_vip: bool,
    },
    BlockLocker {
        locker_id: i64,
        reason: String,
    },
    UnblockLocker {
        locker_id: i64,
    },
    ResetLocker {
        locker_id: i64,
    },
    Buzzer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
}

impl CommandPayload {
    /// The discriminator stored alongside the payload.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::OpenLocker { .. } => CommandKind::OpenLocker,
            Self::CloseLocker { .. } => CommandKind::CloseLocker,
            Self::BulkOpen { .. } => CommandKind::BulkOpen,
            Self::BlockLocker { .. } => CommandKind::BlockLocker,
            Self::UnblockLocker { .. } => CommandKind::UnblockLocker,
            Self::ResetLocker { .. } => CommandKind::ResetLocker,
            Self::Buzzer { .. } => CommandKind::Buzzer,
        }
    }

    /// The single locker this command targets, if it targets one.
    #[must_use]
    pub fn locker_id(&self) -> Option<i64> {
        match self {
            Self::OpenLocker { locker_id, .. }
            | Self::CloseLocker { locker_id }
            | Self::BlockLocker { locker_id, .. }
            | Self::UnblockLocker { locker_id }
            | Self::ResetLocker { locker_id } => Some(*locker_id),
            Self::BulkOpen { .. } | Self::Buzzer { .. } => None,
        }
    }
}

/// A queued command row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Command {
    pub command_id: Uuid,
    pub kiosk_id: String,
    pub kind: CommandKind,
    pub payload: Json<CommandPayload>,
    pub status: CommandStatus,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Ancillary per-execution audit row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommandLogEntry {
    pub id: i64,
    pub command_id: String,
    pub kiosk_id: String,
    pub locker_id: Option<i64>,
    pub kind: CommandKind,
    pub issued_by: String,
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ── Events ───────────────────────────────────────────────────────────

/// The enumerated set of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventType {
    LockerReserved,
    OpeningStarted,
    OpeningFinished,
    RfidAssign,
    RfidRelease,
    QrAssign,
    QrRelease,
    VipAssign,
    VipRelease,
    VipAccess,
    StaffAssign,
    StaffRelease,
    StaffOpen,
    BulkOpen,
    EmergencyOpen,
    LockerBlocked,
    LockerUnblocked,
    ReservationExpired,
    OpeningTimeout,
    SessionCancelled,
    SessionExpired,
    Restarted,
    CommandsCleared,
    KioskOnline,
    KioskOffline,
    Provisioned,
    EnrollmentCompleted,
    HardwareError,
    ConfigUpdated,
    ZoneExtended,
    ZoneExtensionFailed,
    StaffAudit,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockerReserved => "locker_reserved",
            Self::OpeningStarted => "opening_started",
            Self::OpeningFinished => "opening_finished",
            Self::RfidAssign => "rfid_assign",
            Self::RfidRelease => "rfid_release",
            Self::QrAssign => "qr_assign",
            Self::QrRelease => "qr_release",
            Self::VipAssign => "vip_assign",
            Self::VipRelease => "vip_release",
            Self::VipAccess => "vip_access",
            Self::StaffAssign => "staff_assign",
            Self::StaffRelease => "staff_release",
            Self::StaffOpen => "staff_open",
            Self::BulkOpen => "bulk_open",
            Self::EmergencyOpen => "emergency_open",
            Self::LockerBlocked => "locker_blocked",
            Self::LockerUnblocked => "locker_unblocked",
            Self::ReservationExpired => "reservation_expired",
            Self::OpeningTimeout => "opening_timeout",
            Self::SessionCancelled => "session_cancelled",
            Self::SessionExpired => "session_expired",
            Self::Restarted => "restarted",
            Self::CommandsCleared => "commands_cleared",
            Self::KioskOnline => "kiosk_online",
            Self::KioskOffline => "kiosk_offline",
            Self::Provisioned => "provisioned",
            Self::EnrollmentCompleted => "enrollment_completed",
            Self::HardwareError => "hardware_error",
            Self::ConfigUpdated => "config_updated",
            Self::ZoneExtended => "zone_extended",
            Self::ZoneExtensionFailed => "zone_extension_failed",
            Self::StaffAudit => "staff_audit",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of structured event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    /// Events with nothing beyond the envelope fields.
    Empty,
    /// Free-form operator-visible note.
    Note { message: String },
    /// Owner fields at the time of an assignment mutation.
    Owner {
        owner_type: OwnerType,
        owner_key: String,
    },
    /// Owner fields at the time of a release mutation.
    Released {
        owner_type: OwnerType,
        previous_status: LockerStatus,
    },
    Blocked {
        reason: String,
    },
    ReservationExpired {
        reserved_at: DateTime<Utc>,
    },
    OpeningTimeout {
        reverted_to: LockerStatus,
    },
    Session {
        rfid_card: String,
    },
    Restarted {
        cleared_commands: u64,
        reason: String,
    },
    CommandsCleared {
        count: u64,
    },
    Provisioned {
        zone: Option<String>,
        hardware_id: String,
    },
    Hardware {
        kind: HardwareErrorKind,
        slave_address: u8,
        channel: u16,
        message: String,
    },
    ZoneExtended {
        zone: String,
        added_cards: Vec<u8>,
        ranges: Vec<LockerRange>,
    },
    ZoneExtensionFailed {
        reason: String,
    },
    BulkOpen {
        requested: u64,
        enqueued: u64,
        excluded_vip: u64,
    },
    EmergencyOpen {
        kiosks: u64,
        lockers: u64,
    },
    Vip {
        contract_id: String,
        rfid_card: String,
    },
    ConfigUpdated {
        config_version: u64,
        config_hash: String,
    },
    StaffAudit {
        action: String,
        resource_type: String,
        resource_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        details: serde_json::Value,
    },
}

/// Event detail envelope. Known variants deserialize into [`EventDetail`];
/// anything else survives as opaque JSON so the log can always be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventDetails {
    Known(EventDetail),
    Opaque(serde_json::Value),
}

impl From<EventDetail> for EventDetails {
    fn from(detail: EventDetail) -> Self {
        Self::Known(detail)
    }
}

/// One persisted event row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Event {
    /// Strictly increasing, never reused.
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i64>,
    pub event_type: EventType,
    pub rfid_card: Option<String>,
    pub staff_user: Option<String>,
    pub details: Json<EventDetails>,
}

/// An event about to be appended.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i64>,
    pub event_type: EventType,
    pub rfid_card: Option<String>,
    pub staff_user: Option<String>,
    pub details: EventDetails,
}

impl NewEvent {
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            kiosk_id: None,
            locker_id: None,
            event_type,
            rfid_card: None,
            staff_user: None,
            details: EventDetails::Known(EventDetail::Empty),
        }
    }

    #[must_use]
    pub fn kiosk(mut self, kiosk_id: &str) -> Self {
        self.kiosk_id = Some(kiosk_id.to_owned());
        self
    }

    #[must_use]
    pub fn locker(mut self, locker_id: i64) -> Self {
        self.locker_id = Some(locker_id);
        self
    }

    #[must_use]
    pub fn card(mut self, rfid_card: &str) -> Self {
        self.rfid_card = Some(rfid_card.to_owned());
        self
    }

    #[must_use]
    pub fn staff(mut self, staff_user: &str) -> Self {
        self.staff_user = Some(staff_user.to_owned());
        self
    }

    #[must_use]
    pub fn details(mut self, detail: EventDetail) -> Self {
        self.details = EventDetails::Known(detail);
        self
    }
}

// ── Kiosks ───────────────────────────────────────────────────────────

/// Coordination status of a kiosk as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum KioskStatus {
    Provisioning,
    Online,
    Offline,
}

impl KioskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for KioskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kiosk's heartbeat row, owned by the gateway side.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct KioskHeartbeat {
    pub kiosk_id: String,
    pub zone: Option<String>,
    pub version: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub status: KioskStatus,
    pub hardware_id: String,
    #[serde(skip_serializing)]
    pub registration_secret: String,
    pub last_config_hash: Option<String>,
    pub degraded: bool,
    pub offline_threshold_seconds: i64,
}

/// A one-shot kiosk enrollment token.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProvisioningToken {
    pub token: String,
    pub kiosk_id: String,
    pub zone: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

// ── VIP contracts ────────────────────────────────────────────────────

/// Lifecycle status of a VIP contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum VipContractStatus {
    Active,
    Expired,
    Cancelled,
}

impl VipContractStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for VipContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-bounded exclusive locker binding for one RFID card.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VipContract {
    pub id: Uuid,
    pub kiosk_id: String,
    pub locker_id: i64,
    pub rfid_card: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: VipContractStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_payload_has_canonical_tagged_form() {
        let payload = CommandPayload::BulkOpen {
            locker_ids: vec![1, 2, 3],
            exclude_vip: true,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "bulk_open");
        assert_eq!(json["locker_ids"], serde_json::json!([1, 2, 3]));

        let back: CommandPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn event_detail_roundtrip_is_stable() {
        let detail = EventDetails::Known(EventDetail::Restarted {
            cleared_commands: 2,
            reason: "power_interruption".to_owned(),
        });
        let encoded = serde_json::to_string(&detail).unwrap();
        let decoded: EventDetails = serde_json::from_str(&encoded).unwrap();
        let re_encoded = serde_json::to_string(&decoded).unwrap();
        assert_eq!(decoded, detail);
        assert_eq!(re_encoded, encoded);
    }

    #[test]
    fn unknown_event_detail_survives_as_opaque() {
        let raw = r#"{"type":"from_the_future","field":42}"#;
        let decoded: EventDetails = serde_json::from_str(raw).unwrap();
        assert!(matches!(decoded, EventDetails::Opaque(_)));
        let re_encoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(re_encoded["field"], 42);
    }

    #[test]
    fn locker_label_falls_back_to_dolap() {
        let locker = Locker {
            kiosk_id: "kiosk-1".to_owned(),
            locker_id: 7,
            status: LockerStatus::Free,
            owner_type: OwnerType::None,
            owner_key: None,
            reserved_at: None,
            owned_at: None,
            version: 0,
            is_vip: false,
            enabled: true,
            display_name: None,
        };
        assert_eq!(locker.label(), "Dolap 7");
    }
}
