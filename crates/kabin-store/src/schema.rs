//! Schema bootstrap.
//!
//! All tables are created with `IF NOT EXISTS` so bootstrap is idempotent —
//! the gateway, kiosk agent, and panel all call it on startup and the first
//! one to open the file wins. Timestamps are stored as UTC text with
//! sub-second precision; booleans as integers.

/// DDL statements executed in order by [`crate::Db::init_schema`].
pub(crate) const SCHEMA: &[&str] = &[
    // Single source of truth for every physical locker.
    r"CREATE TABLE IF NOT EXISTS lockers (
        kiosk_id     TEXT    NOT NULL,
        locker_id    INTEGER NOT NULL,
        status       TEXT    NOT NULL DEFAULT 'free',
        owner_type   TEXT    NOT NULL DEFAULT 'none',
        owner_key    TEXT,
        reserved_at  TEXT,
        owned_at     TEXT,
        version      INTEGER NOT NULL DEFAULT 0,
        is_vip       INTEGER NOT NULL DEFAULT 0,
        enabled      INTEGER NOT NULL DEFAULT 1,
        display_name TEXT,
        PRIMARY KEY (kiosk_id, locker_id)
    )",
    // Owner uniqueness checks scan this index inside the reserving transaction.
    r"CREATE INDEX IF NOT EXISTS idx_lockers_owner
        ON lockers (owner_type, owner_key) WHERE owner_key IS NOT NULL",
    r"CREATE TABLE IF NOT EXISTS vip_contracts (
        id         TEXT    PRIMARY KEY,
        kiosk_id   TEXT    NOT NULL,
        locker_id  INTEGER NOT NULL,
        rfid_card  TEXT    NOT NULL,
        start_date TEXT    NOT NULL,
        end_date   TEXT    NOT NULL,
        status     TEXT    NOT NULL DEFAULT 'active',
        created_by TEXT    NOT NULL,
        created_at TEXT    NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_vip_locker
        ON vip_contracts (kiosk_id, locker_id, status)",
    r"CREATE INDEX IF NOT EXISTS idx_vip_card
        ON vip_contracts (rfid_card, status)",
    // Append-only event log. seq is AUTOINCREMENT so it is strictly
    // increasing and never reused, even after deletes.
    r"CREATE TABLE IF NOT EXISTS events (
        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
        ts         TEXT    NOT NULL,
        kiosk_id   TEXT,
        locker_id  INTEGER,
        event_type TEXT    NOT NULL,
        rfid_card  TEXT,
        staff_user TEXT,
        details    TEXT    NOT NULL DEFAULT '{}'
    )",
    r"CREATE INDEX IF NOT EXISTS idx_events_kiosk ON events (kiosk_id, seq)",
    r"CREATE INDEX IF NOT EXISTS idx_events_type  ON events (event_type, seq)",
    r"CREATE INDEX IF NOT EXISTS idx_events_ts    ON events (ts)",
    // Durable per-kiosk command queue.
    r"CREATE TABLE IF NOT EXISTS commands (
        command_id       TEXT    PRIMARY KEY,
        kiosk_id         TEXT    NOT NULL,
        kind             TEXT    NOT NULL,
        payload          TEXT    NOT NULL,
        status           TEXT    NOT NULL DEFAULT 'pending',
        attempts         INTEGER NOT NULL DEFAULT 0,
        max_retries      INTEGER NOT NULL DEFAULT 3,
        created_at       TEXT    NOT NULL,
        scheduled_at     TEXT    NOT NULL,
        lease_expires_at TEXT,
        completed_at     TEXT,
        last_error       TEXT
    )",
    r"CREATE INDEX IF NOT EXISTS idx_commands_poll
        ON commands (kiosk_id, status, scheduled_at)",
    r"CREATE TABLE IF NOT EXISTS command_log (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        command_id        TEXT    NOT NULL,
        kiosk_id          TEXT    NOT NULL,
        locker_id         INTEGER,
        kind              TEXT    NOT NULL,
        issued_by         TEXT    NOT NULL,
        success           INTEGER NOT NULL,
        message           TEXT,
        error             TEXT,
        execution_time_ms INTEGER,
        created_at        TEXT    NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS kiosk_heartbeats (
        kiosk_id                  TEXT    PRIMARY KEY,
        zone                      TEXT,
        version                   TEXT,
        last_seen                 TEXT    NOT NULL,
        status                    TEXT    NOT NULL DEFAULT 'provisioning',
        hardware_id               TEXT    NOT NULL,
        registration_secret       TEXT    NOT NULL,
        last_config_hash          TEXT,
        degraded                  INTEGER NOT NULL DEFAULT 0,
        offline_threshold_seconds INTEGER NOT NULL DEFAULT 30
    )",
    r"CREATE TABLE IF NOT EXISTS provisioning_tokens (
        token      TEXT    PRIMARY KEY,
        kiosk_id   TEXT    NOT NULL,
        zone       TEXT,
        expires_at TEXT    NOT NULL,
        used       INTEGER NOT NULL DEFAULT 0,
        used_at    TEXT
    )",
];
