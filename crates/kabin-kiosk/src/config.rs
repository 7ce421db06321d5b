//! Kiosk agent configuration.
//!
//! Loaded from environment variables with sensible defaults. The agent
//! shares `KABIN_DB_PATH` / `KABIN_CONFIG_PATH` with the other processes;
//! everything serial- or kiosk-specific has its own variable.

use std::net::SocketAddr;
use std::time::Duration;

use kabin_core::zone::CoilAddress;

/// Runtime configuration for one kiosk agent.
#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// This kiosk's identity, assigned at provisioning.
    pub kiosk_id: String,
    /// Hardware id presented on every gateway request.
    pub hardware_id: String,
    /// Registration secret issued at provisioning.
    pub kiosk_secret: String,
    /// Base URL of the gateway.
    pub gateway_url: String,
    /// Zone this kiosk serves, when zones are enabled.
    pub kiosk_zone: Option<String>,
    /// Address for the local QR HTTP surface.
    pub bind_addr: SocketAddr,
    /// Database file shared with gateway and panel.
    pub db_path: String,
    /// Configuration document path.
    pub config_path: String,
    /// Log filter.
    pub log_level: String,
    /// Serial device; `None` runs the loopback port (no hardware).
    pub serial_port: Option<String>,
    /// Bus speed.
    pub modbus_baud: u32,
    /// Pulse ON-to-OFF delay.
    pub pulse_duration: Duration,
    /// HMAC secret for QR action tokens.
    pub qr_hmac_secret: String,
    /// Optional buzzer coil.
    pub buzzer: Option<CoilAddress>,
    /// Staff master PIN for on-kiosk overrides; unset disables the flow.
    pub master_pin: Option<String>,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Command poll cadence.
    pub poll_interval: Duration,
    /// Reason reported with the restart marker on the first heartbeat.
    pub restart_reason: String,
}

impl KioskConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `KABIN_KIOSK_ID` — kiosk identity (default: `kiosk-1`)
    /// - `KABIN_HARDWARE_ID` — hardware id (default: `dev-hardware`)
    /// - `KABIN_KIOSK_SECRET` — registration secret (default: empty)
    /// - `KABIN_GATEWAY_URL` — gateway base URL (default: `http://127.0.0.1:8080`)
    /// - `KIOSK_ZONE` — zone id served by this kiosk (optional)
    /// - `KABIN_KIOSK_BIND_ADDR` — QR HTTP bind address (default: `0.0.0.0:8081`)
    /// - `KABIN_DB_PATH` — shared database file (default: `./data/kabin.db`)
    /// - `KABIN_CONFIG_PATH` — configuration document (default: `./config/system.json`)
    /// - `KABIN_LOG_LEVEL` — log filter (default: `info`)
    /// - `KIOSK_SERIAL_PORT` — serial device path (optional; loopback when unset)
    /// - `MODBUS_BAUD` — bus speed (default: `9600`)
    /// - `MODBUS_PULSE_MS` — pulse duration (default: `400`)
    /// - `QR_HMAC_SECRET` — action token secret (default: dev-only constant)
    /// - `KABIN_BUZZER_SLAVE` / `KABIN_BUZZER_CHANNEL` — buzzer coil (optional)
    /// - `KABIN_MASTER_PIN` — staff override PIN (optional; unset disables it)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("KABIN_KIOSK_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8081)));

        let buzzer = match (
            env_parse::<u8>("KABIN_BUZZER_SLAVE"),
            env_parse::<u16>("KABIN_BUZZER_CHANNEL"),
        ) {
            (Some(slave_address), Some(channel)) => Some(CoilAddress {
                slave_address,
                channel,
            }),
            _ => None,
        };

        Self {
            kiosk_id: env_or("KABIN_KIOSK_ID", "kiosk-1"),
            hardware_id: env_or("KABIN_HARDWARE_ID", "dev-hardware"),
            kiosk_secret: env_or("KABIN_KIOSK_SECRET", ""),
            gateway_url: env_or("KABIN_GATEWAY_URL", "http://127.0.0.1:8080"),
            kiosk_zone: std::env::var("KIOSK_ZONE").ok().filter(|z| !z.is_empty()),
            bind_addr,
            db_path: env_or("KABIN_DB_PATH", "./data/kabin.db"),
            config_path: env_or("KABIN_CONFIG_PATH", "./config/system.json"),
            log_level: env_or("KABIN_LOG_LEVEL", "info"),
            serial_port: std::env::var("KIOSK_SERIAL_PORT").ok().filter(|p| !p.is_empty()),
            modbus_baud: env_parse("MODBUS_BAUD").unwrap_or(9600),
            pulse_duration: Duration::from_millis(env_parse("MODBUS_PULSE_MS").unwrap_or(400)),
            qr_hmac_secret: env_or("QR_HMAC_SECRET", "kabin-dev-qr-secret"),
            buzzer,
            master_pin: std::env::var("KABIN_MASTER_PIN").ok().filter(|p| !p.is_empty()),
            heartbeat_interval: Duration::from_secs(env_parse("KABIN_HEARTBEAT_SECS").unwrap_or(10)),
            poll_interval: Duration::from_secs(env_parse("KABIN_POLL_SECS").unwrap_or(2)),
            restart_reason: env_or("KABIN_RESTART_REASON", "power_interruption"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
