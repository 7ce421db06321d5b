//! Shared application state for the kiosk HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::qr::QrTokenSigner;
use kabin_core::ratelimit::RateLimiter;
use kabin_core::state::StateStore;
use kabin_store::Db;

use crate::driver::RelayDriver;
use crate::flows::RfidFlow;

/// Crate version reported by `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state passed to all kiosk HTTP handlers.
pub struct AppState {
    pub db: Db,
    pub state: StateStore,
    pub events: EventLogger,
    pub limiter: RateLimiter,
    pub signer: QrTokenSigner,
    pub driver: RelayDriver,
    pub flow: RfidFlow,
    pub config: Arc<ConfigManager>,
    pub kiosk_id: String,
    pub kiosk_zone: Option<String>,
    pub master_pin: Option<String>,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
