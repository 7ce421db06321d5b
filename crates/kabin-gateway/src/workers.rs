//! Background sweepers.
//!
//! One ticking task drives every deadline in the system: reservation
//! expiry (90 s), opening timeout (20 s), command lease recovery, offline
//! detection (30 s), VIP contract expiry, and provisioning token purge.
//! Deadlines live in the rows themselves; the sweepers just compare them
//! against now — there is no per-record timer anywhere.

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::warn;

use kabin_core::commands::CommandQueue;
use kabin_core::heartbeat::HeartbeatManager;
use kabin_core::provisioning::Provisioner;
use kabin_core::state::StateStore;
use kabin_core::vip::VipContracts;

/// Reservations not confirmed within this window return to Free.
pub const RESERVATION_TTL_SECS: i64 = 90;

/// Lockers stuck in Opening longer than this are swept back.
pub const OPENING_TIMEOUT_SECS: i64 = 20;

/// Everything the sweep loop needs.
pub struct Sweepers {
    pub state: StateStore,
    pub queue: CommandQueue,
    pub heartbeats: HeartbeatManager,
    pub vip: VipContracts,
    pub provisioner: Provisioner,
}

impl Sweepers {
    /// Run all sweepers until the shutdown channel flips.
    pub async fn run(self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.sweep_once().await;
        }
    }

    /// One pass over every deadline. Errors are logged and do not stop
    /// the other sweepers.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        if let Err(err) = self
            .state
            .expire_reservations(now - Duration::seconds(RESERVATION_TTL_SECS))
            .await
        {
            warn!(error = %err, "reservation sweep failed");
        }
        if let Err(err) = self
            .state
            .sweep_opening(now - Duration::seconds(OPENING_TIMEOUT_SECS))
            .await
        {
            warn!(error = %err, "opening sweep failed");
        }
        if let Err(err) = self.queue.sweep_leases(now).await {
            warn!(error = %err, "command lease sweep failed");
        }
        if let Err(err) = self.heartbeats.sweep_offline(now).await {
            warn!(error = %err, "offline sweep failed");
        }
        if let Err(err) = self.vip.sweep_expired(now).await {
            warn!(error = %err, "VIP expiry sweep failed");
        }
        if let Err(err) = self.provisioner.purge_expired(now).await {
            warn!(error = %err, "provisioning token purge failed");
        }
    }
}
