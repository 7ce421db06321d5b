//! Kiosk heartbeat tracking.
//!
//! Kiosks ping the gateway on a fixed interval; the manager records
//! `last_seen` and flips kiosks back online when they return. A sweeper
//! marks kiosks offline once `last_seen` falls behind their threshold.
//! Offline is a pure observation — locker state is untouched, and the
//! command queue keeps accumulating until the kiosk comes back.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

use kabin_store::Db;

use crate::error::HeartbeatError;
use crate::events::EventLogger;
use crate::types::{EventType, KioskHeartbeat, KioskStatus, NewEvent};

/// Default seconds of silence before a kiosk is considered offline.
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 30;

/// Tracks kiosk liveness. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HeartbeatManager {
    pool: SqlitePool,
    events: EventLogger,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(db: &Db, events: EventLogger) -> Self {
        Self {
            pool: db.pool().clone(),
            events,
        }
    }

    /// Create (or replace) the heartbeat row for a newly provisioned kiosk.
    pub async fn register(
        &self,
        kiosk_id: &str,
        zone: Option<&str>,
        hardware_id: &str,
        registration_secret: &str,
        version: Option<&str>,
    ) -> Result<(), HeartbeatError> {
        sqlx::query(
            r"INSERT OR REPLACE INTO kiosk_heartbeats
                (kiosk_id, zone, version, last_seen, status, hardware_id,
                 registration_secret, offline_threshold_seconds)
              VALUES (?, ?, ?, ?, 'provisioning', ?, ?, ?)",
        )
        .bind(kiosk_id)
        .bind(zone)
        .bind(version)
        .bind(Utc::now())
        .bind(hardware_id)
        .bind(registration_secret)
        .bind(DEFAULT_OFFLINE_THRESHOLD_SECS)
        .execute(&self.pool)
        .await?;
        info!(kiosk_id, zone, "kiosk registered");
        Ok(())
    }

    /// Record a ping: refresh `last_seen`, version, config hash, and the
    /// hardware-degraded flag. An offline kiosk transitions back online
    /// with a `kiosk_online` event.
    pub async fn ping(
        &self,
        kiosk_id: &str,
        version: &str,
        config_hash: &str,
        degraded: bool,
    ) -> Result<KioskHeartbeat, HeartbeatError> {
        let row = self.get(kiosk_id).await?;

        let next_status = match row.status {
            KioskStatus::Offline => KioskStatus::Online,
            other => other,
        };

        sqlx::query(
            r"UPDATE kiosk_heartbeats
              SET last_seen = ?, version = ?, last_config_hash = ?, degraded = ?, status = ?
              WHERE kiosk_id = ?",
        )
        .bind(Utc::now())
        .bind(version)
        .bind(config_hash)
        .bind(degraded)
        .bind(next_status)
        .bind(kiosk_id)
        .execute(&self.pool)
        .await?;

        if row.status == KioskStatus::Offline {
            self.events
                .append(NewEvent::new(EventType::KioskOnline).kiosk(kiosk_id))
                .await
                .map_err(|crate::error::EventError::Storage(e)| HeartbeatError::Storage(e))?;
            info!(kiosk_id, "kiosk back online");
        }

        self.get(kiosk_id).await
    }

    /// Move a kiosk from `provisioning` to `online` once enrollment is done.
    pub async fn complete_enrollment(&self, kiosk_id: &str) -> Result<(), HeartbeatError> {
        let row = self.get(kiosk_id).await?;
        if row.status != KioskStatus::Provisioning {
            return Ok(());
        }
        sqlx::query(
            "UPDATE kiosk_heartbeats SET status = 'online', last_seen = ? WHERE kiosk_id = ?",
        )
        .bind(Utc::now())
        .bind(kiosk_id)
        .execute(&self.pool)
        .await?;

        self.events
            .append(NewEvent::new(EventType::EnrollmentCompleted).kiosk(kiosk_id))
            .await
            .map_err(|crate::error::EventError::Storage(e)| HeartbeatError::Storage(e))?;
        info!(kiosk_id, "enrollment completed");
        Ok(())
    }

    /// Mark kiosks offline whose `last_seen` is older than their threshold.
    pub async fn sweep_offline(&self, now: DateTime<Utc>) -> Result<u64, HeartbeatError> {
        let online = sqlx::query_as::<_, KioskHeartbeat>(
            "SELECT * FROM kiosk_heartbeats WHERE status = 'online'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut marked = 0u64;
        for kiosk in online {
            let threshold = Duration::seconds(kiosk.offline_threshold_seconds);
            if now - kiosk.last_seen <= threshold {
                continue;
            }

            let applied = sqlx::query(
                r"UPDATE kiosk_heartbeats
                  SET status = 'offline'
                  WHERE kiosk_id = ? AND status = 'online' AND last_seen = ?",
            )
            .bind(&kiosk.kiosk_id)
            .bind(kiosk.last_seen)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if applied == 0 {
                // The kiosk pinged between our read and the update.
                continue;
            }

            self.events
                .append(NewEvent::new(EventType::KioskOffline).kiosk(&kiosk.kiosk_id))
                .await
                .map_err(|crate::error::EventError::Storage(e)| HeartbeatError::Storage(e))?;
            warn!(kiosk_id = %kiosk.kiosk_id, last_seen = %kiosk.last_seen, "kiosk marked offline");
            marked += 1;
        }

        Ok(marked)
    }

    /// Fetch one kiosk's heartbeat row.
    pub async fn get(&self, kiosk_id: &str) -> Result<KioskHeartbeat, HeartbeatError> {
        sqlx::query_as::<_, KioskHeartbeat>(
            "SELECT * FROM kiosk_heartbeats WHERE kiosk_id = ?",
        )
        .bind(kiosk_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HeartbeatError::UnknownKiosk {
            kiosk_id: kiosk_id.to_owned(),
        })
    }

    /// All kiosks, for the staff panel's monitor view.
    pub async fn list(&self) -> Result<Vec<KioskHeartbeat>, HeartbeatError> {
        let kiosks = sqlx::query_as::<_, KioskHeartbeat>(
            "SELECT * FROM kiosk_heartbeats ORDER BY kiosk_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(kiosks)
    }

    /// Kiosks currently considered online.
    pub async fn online(&self) -> Result<Vec<KioskHeartbeat>, HeartbeatError> {
        let kiosks = sqlx::query_as::<_, KioskHeartbeat>(
            "SELECT * FROM kiosk_heartbeats WHERE status = 'online' ORDER BY kiosk_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(kiosks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn manager() -> (HeartbeatManager, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        (HeartbeatManager::new(&db, events.clone()), events)
    }

    #[tokio::test]
    async fn ping_without_registration_is_rejected() {
        let (manager, _) = manager().await;
        let err = manager.ping("ghost", "1.0.0", "hash", false).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::UnknownKiosk { .. }));
    }

    #[tokio::test]
    async fn register_then_enroll_goes_online() {
        let (manager, _) = manager().await;
        manager
            .register("kiosk-1", Some("mens"), "hw-01", "secret", Some("1.0.0"))
            .await
            .unwrap();
        assert_eq!(
            manager.get("kiosk-1").await.unwrap().status,
            KioskStatus::Provisioning
        );

        manager.complete_enrollment("kiosk-1").await.unwrap();
        assert_eq!(
            manager.get("kiosk-1").await.unwrap().status,
            KioskStatus::Online
        );
    }

    #[tokio::test]
    async fn silent_kiosk_goes_offline_and_returns() {
        let (manager, events) = manager().await;
        manager
            .register("kiosk-1", None, "hw-01", "secret", None)
            .await
            .unwrap();
        manager.complete_enrollment("kiosk-1").await.unwrap();

        // Not yet past the threshold.
        let now = Utc::now() + Duration::seconds(DEFAULT_OFFLINE_THRESHOLD_SECS - 1);
        assert_eq!(manager.sweep_offline(now).await.unwrap(), 0);

        // Past it.
        let later = Utc::now() + Duration::seconds(DEFAULT_OFFLINE_THRESHOLD_SECS + 1);
        assert_eq!(manager.sweep_offline(later).await.unwrap(), 1);
        assert_eq!(
            manager.get("kiosk-1").await.unwrap().status,
            KioskStatus::Offline
        );

        // A ping brings it back with a kiosk_online event.
        let refreshed = manager.ping("kiosk-1", "1.0.1", "hash", false).await.unwrap();
        assert_eq!(refreshed.status, KioskStatus::Online);
        assert_eq!(refreshed.version.as_deref(), Some("1.0.1"));

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::KioskOnline);
    }

    #[tokio::test]
    async fn ping_records_degraded_flag() {
        let (manager, _) = manager().await;
        manager
            .register("kiosk-1", None, "hw-01", "secret", None)
            .await
            .unwrap();
        manager.complete_enrollment("kiosk-1").await.unwrap();

        let row = manager.ping("kiosk-1", "1.0.0", "hash", true).await.unwrap();
        assert!(row.degraded);
    }
}
