//! Gateway configuration, from environment variables.

use std::net::SocketAddr;

/// Gateway process configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Shared database file.
    pub db_path: String,
    /// Configuration document path.
    pub config_path: String,
    /// Log filter.
    pub log_level: String,
    /// Secret for deriving kiosk registration secrets.
    pub provisioning_secret: String,
    /// Panel URL handed to kiosks at registration.
    pub panel_url: String,
    /// Commands leased per poll.
    pub poll_batch: i64,
    /// Lease duration for polled commands, seconds.
    pub command_lease_secs: i64,
    /// Cadence of the background sweepers, seconds.
    pub sweep_interval_secs: u64,
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `KABIN_GATEWAY_BIND_ADDR` — bind address (default: `0.0.0.0:8080`)
    /// - `KABIN_DB_PATH` — shared database file (default: `./data/kabin.db`)
    /// - `KABIN_CONFIG_PATH` — configuration document (default: `./config/system.json`)
    /// - `KABIN_LOG_LEVEL` — log filter (default: `info`)
    /// - `PROVISIONING_SECRET` — registration secret key (default: dev-only constant)
    /// - `PANEL_URL` — staff panel URL for kiosks (default: `http://127.0.0.1:8090`)
    /// - `KABIN_POLL_BATCH` — commands per poll (default: `10`)
    /// - `KABIN_COMMAND_LEASE_SECS` — command lease (default: `60`)
    /// - `KABIN_SWEEP_INTERVAL_SECS` — sweeper cadence (default: `5`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("KABIN_GATEWAY_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        Self {
            bind_addr,
            db_path: env_or("KABIN_DB_PATH", "./data/kabin.db"),
            config_path: env_or("KABIN_CONFIG_PATH", "./config/system.json"),
            log_level: env_or("KABIN_LOG_LEVEL", "info"),
            provisioning_secret: env_or("PROVISIONING_SECRET", "kabin-dev-provisioning-secret"),
            panel_url: env_or("PANEL_URL", "http://127.0.0.1:8090"),
            poll_batch: env_parse("KABIN_POLL_BATCH").unwrap_or(10),
            command_lease_secs: env_parse("KABIN_COMMAND_LEASE_SECS").unwrap_or(60),
            sweep_interval_secs: env_parse("KABIN_SWEEP_INTERVAL_SECS").unwrap_or(5),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
