//! Shared application state for the gateway.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. Every manager is an explicit dependency built
//! in `main` — the composition root — never a global lookup.

use std::sync::Arc;
use std::time::Instant;

use kabin_core::audit::StaffAudit;
use kabin_core::commands::CommandQueue;
use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::heartbeat::HeartbeatManager;
use kabin_core::provisioning::Provisioner;
use kabin_core::state::StateStore;
use kabin_core::vip::VipContracts;
use kabin_store::Db;

use crate::config::GatewayConfig;

/// Crate version reported by `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state passed to all gateway HTTP handlers.
pub struct AppState {
    pub db: Db,
    pub config: GatewayConfig,
    pub system_config: Arc<ConfigManager>,
    pub events: EventLogger,
    pub state: StateStore,
    pub queue: CommandQueue,
    pub heartbeats: HeartbeatManager,
    pub provisioner: Provisioner,
    pub vip: VipContracts,
    pub audit: StaffAudit,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
