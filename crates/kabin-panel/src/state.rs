//! Shared application state for the panel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use kabin_core::audit::StaffAudit;
use kabin_core::commands::CommandQueue;
use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::heartbeat::HeartbeatManager;
use kabin_core::state::StateStore;
use kabin_core::vip::VipContracts;
use kabin_store::Db;

/// Crate version reported by `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Panel process configuration, from environment variables.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub bind_addr: SocketAddr,
    pub db_path: String,
    pub config_path: String,
    pub log_level: String,
}

impl PanelConfig {
    /// Variables: `KABIN_PANEL_BIND_ADDR` (default `0.0.0.0:8090`),
    /// `KABIN_DB_PATH`, `KABIN_CONFIG_PATH`, `KABIN_LOG_LEVEL`.
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("KABIN_PANEL_BIND_ADDR")
            .ok()
            .and_then(|addr| addr.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8090)));

        let env_or = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_owned())
        };

        Self {
            bind_addr,
            db_path: env_or("KABIN_DB_PATH", "./data/kabin.db"),
            config_path: env_or("KABIN_CONFIG_PATH", "./config/system.json"),
            log_level: env_or("KABIN_LOG_LEVEL", "info"),
        }
    }
}

/// Shared state passed to all panel HTTP handlers.
pub struct AppState {
    pub db: Db,
    pub system_config: Arc<ConfigManager>,
    pub events: EventLogger,
    pub state: StateStore,
    pub queue: CommandQueue,
    pub heartbeats: HeartbeatManager,
    pub vip: VipContracts,
    pub audit: StaffAudit,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
