//! Locker state machine and ownership store.
//!
//! Every mutation runs under a per-(kiosk, locker) critical section, commits
//! atomically with an optimistic version check, writes exactly one event in
//! the same transaction, and publishes a [`StateChanged`] notification after
//! commit. The version check matters even under the row lock: the gateway,
//! kiosk agent, and panel are separate processes sharing one database file.
//!
//! On a version mismatch the operation retries once and then fails `Busy`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use kabin_store::Db;

use crate::config::{SystemConfig, ZoneConfig};
use crate::error::StateError;
use crate::events::EventLogger;
use crate::types::{
    EventDetail, EventType, Locker, LockerStatus, NewEvent, OwnerType, StateChanged,
};

/// Identity on whose behalf a mutation runs, stamped into the emitted event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Actor<'a> {
    pub rfid_card: Option<&'a str>,
    pub staff_user: Option<&'a str>,
}

impl<'a> Actor<'a> {
    /// Background sweepers and hardware-originated transitions.
    #[must_use]
    pub fn system() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn card(rfid_card: &'a str) -> Self {
        Self {
            rfid_card: Some(rfid_card),
            staff_user: None,
        }
    }

    #[must_use]
    pub fn staff(staff_user: &'a str) -> Self {
        Self {
            rfid_card: None,
            staff_user: Some(staff_user),
        }
    }
}

/// The single source of truth for every locker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
    events: EventLogger,
    locks: Arc<StdMutex<HashMap<(String, i64), Arc<Mutex<()>>>>>,
    changes: broadcast::Sender<StateChanged>,
}

impl StateStore {
    #[must_use]
    pub fn new(db: &Db, events: EventLogger) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            pool: db.pool().clone(),
            events,
            locks: Arc::new(StdMutex::new(HashMap::new())),
            changes,
        }
    }

    /// Subscribe to committed state transitions. Per locker, delivery
    /// order matches commit order.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChanged> {
        self.changes.subscribe()
    }

    /// Insert missing locker rows up to `count`, applying display and
    /// enable overrides from the configuration at insert time.
    pub async fn ensure_lockers(
        &self,
        kiosk_id: &str,
        count: i64,
        config: &SystemConfig,
    ) -> Result<u64, StateError> {
        let mut tx = self.pool.begin().await?;
        let mut created = 0u64;
        for locker_id in 1..=count {
            let overridden = config.locker_override(locker_id);
            let result = sqlx::query(
                r"INSERT OR IGNORE INTO lockers (kiosk_id, locker_id, display_name, enabled)
                  VALUES (?, ?, ?, ?)",
            )
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(overridden.and_then(|o| o.display_name.clone()))
            .bind(overridden.is_none_or(|o| o.enabled))
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected();
        }
        tx.commit().await?;
        if created > 0 {
            info!(kiosk_id, created, "locker rows created");
        }
        Ok(created)
    }

    /// Fetch one locker.
    pub async fn get(&self, kiosk_id: &str, locker_id: i64) -> Result<Locker, StateError> {
        sqlx::query_as::<_, Locker>(
            "SELECT * FROM lockers WHERE kiosk_id = ? AND locker_id = ?",
        )
        .bind(kiosk_id)
        .bind(locker_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StateError::NotFound {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// All lockers on a kiosk, ordered by id.
    pub async fn all(&self, kiosk_id: &str) -> Result<Vec<Locker>, StateError> {
        let lockers = sqlx::query_as::<_, Locker>(
            "SELECT * FROM lockers WHERE kiosk_id = ? ORDER BY locker_id",
        )
        .bind(kiosk_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lockers)
    }

    /// Free, enabled, non-VIP lockers — the user-selection pool. When a
    /// zone is given, only lockers inside its ranges are returned.
    pub async fn available(
        &self,
        kiosk_id: &str,
        zone: Option<&ZoneConfig>,
    ) -> Result<Vec<Locker>, StateError> {
        let lockers = sqlx::query_as::<_, Locker>(
            r"SELECT * FROM lockers
              WHERE kiosk_id = ? AND status = 'free' AND is_vip = 0 AND enabled = 1
              ORDER BY locker_id",
        )
        .bind(kiosk_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(match zone {
            Some(zone) => lockers
                .into_iter()
                .filter(|l| zone.contains(l.locker_id))
                .collect(),
            None => lockers,
        })
    }

    /// Find the locker held by an owner, if any. Uniqueness guarantees at
    /// most one row outside VIP.
    pub async fn lookup_by_owner(
        &self,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<Option<Locker>, StateError> {
        let locker = sqlx::query_as::<_, Locker>(
            r"SELECT * FROM lockers
              WHERE owner_type = ? AND owner_key = ?
                AND status IN ('reserved', 'owned', 'opening')
              LIMIT 1",
        )
        .bind(owner_type)
        .bind(owner_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(locker)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Free → Reserved. Rejects VIP and disabled lockers and owners that
    /// already hold a locker of the same owner type anywhere.
    pub async fn reserve(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        owner_type: OwnerType,
        owner_key: &str,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if !row.enabled {
                return Err(StateError::Disabled {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                });
            }
            if row.is_vip {
                return Err(StateError::VipBlocked {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                });
            }
            if row.status != LockerStatus::Free {
                return Err(StateError::InvalidStatus {
                    expected: "free",
                    actual: row.status,
                });
            }

            if let Some(held) = sqlx::query_as::<_, Locker>(
                r"SELECT * FROM lockers
                  WHERE owner_type = ? AND owner_key = ?
                    AND status IN ('reserved', 'owned', 'opening')
                  LIMIT 1",
            )
            .bind(owner_type)
            .bind(owner_key)
            .fetch_optional(&mut *tx)
            .await?
            {
                return Err(StateError::OwnerAlreadyHasLocker {
                    kiosk_id: held.kiosk_id,
                    locker_id: held.locker_id,
                });
            }

            let now = Utc::now();
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'reserved', owner_type = ?, owner_key = ?,
                      reserved_at = ?, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(owner_type)
            .bind(owner_key)
            .bind(now)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::LockerReserved,
                    actor,
                    EventDetail::Owner {
                        owner_type,
                        owner_key: owner_key.to_owned(),
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Reserved, &event);

            let mut updated = row;
            updated.status = LockerStatus::Reserved;
            updated.owner_type = owner_type;
            updated.owner_key = Some(owner_key.to_owned());
            updated.reserved_at = Some(now);
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Reserved → Owned, after the unlatch pulse succeeded.
    pub async fn confirm(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status != LockerStatus::Reserved {
                return Err(StateError::InvalidStatus {
                    expected: "reserved",
                    actual: row.status,
                });
            }

            let now = Utc::now();
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'owned', owned_at = ?, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(now)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    assign_event(row.owner_type),
                    actor,
                    EventDetail::Owner {
                        owner_type: row.owner_type,
                        owner_key: row.owner_key.clone().unwrap_or_default(),
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Owned, &event);

            let mut updated = row;
            updated.status = LockerStatus::Owned;
            updated.owned_at = Some(now);
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Reserved/Owned/Opening → Free. VIP ownership is only dissolved by
    /// the contract lifecycle and is rejected here.
    pub async fn release(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        expected_owner_key: Option<&str>,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if !row.status.has_owner() {
                return Err(StateError::InvalidStatus {
                    expected: "reserved or owned",
                    actual: row.status,
                });
            }
            if row.owner_type == OwnerType::Vip {
                return Err(StateError::VipProtected);
            }
            if let Some(expected) = expected_owner_key {
                if row.owner_key.as_deref() != Some(expected) {
                    return Err(StateError::NotOwner);
                }
            }

            let applied = self.clear_row(&mut *tx, &row, LockerStatus::Free).await?;
            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    release_event(row.owner_type),
                    actor,
                    EventDetail::Released {
                        owner_type: row.owner_type,
                        previous_status: row.status,
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Free, &event);

            let mut updated = row;
            updated.status = LockerStatus::Free;
            updated.owner_type = OwnerType::None;
            updated.owner_key = None;
            updated.reserved_at = None;
            updated.owned_at = None;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Staff-override assignment: skips the "already has a locker" check
    /// but still refuses VIP lockers.
    pub async fn assign_direct(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        owner_type: OwnerType,
        owner_key: &str,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.is_vip {
                return Err(StateError::VipBlocked {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                });
            }
            if row.status != LockerStatus::Free {
                return Err(StateError::InvalidStatus {
                    expected: "free",
                    actual: row.status,
                });
            }

            let now = Utc::now();
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'owned', owner_type = ?, owner_key = ?,
                      owned_at = ?, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(owner_type)
            .bind(owner_key)
            .bind(now)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::StaffAssign,
                    actor,
                    EventDetail::Owner {
                        owner_type,
                        owner_key: owner_key.to_owned(),
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Owned, &event);

            let mut updated = row;
            updated.status = LockerStatus::Owned;
            updated.owner_type = owner_type;
            updated.owner_key = Some(owner_key.to_owned());
            updated.owned_at = Some(now);
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Take the locker out of service. Any owner fields are cleared —
    /// `Blocked` implies no owner.
    pub async fn block(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        reason: &str,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status == LockerStatus::Blocked {
                return Err(StateError::InvalidStatus {
                    expected: "not blocked",
                    actual: row.status,
                });
            }

            let applied = self.clear_row(&mut *tx, &row, LockerStatus::Blocked).await?;
            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::LockerBlocked,
                    actor,
                    EventDetail::Blocked {
                        reason: reason.to_owned(),
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Blocked, &event);

            let mut updated = row;
            updated.status = LockerStatus::Blocked;
            updated.owner_type = OwnerType::None;
            updated.owner_key = None;
            updated.reserved_at = None;
            updated.owned_at = None;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Like [`Self::block`], but also enqueues the advisory close command
    /// inside the same transaction, so the block and its hardware
    /// follow-up commit or roll back together.
    pub async fn block_with_close(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        reason: &str,
        actor: Actor<'_>,
        queue: &crate::commands::CommandQueue,
    ) -> Result<(Locker, crate::types::Command), StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status == LockerStatus::Blocked {
                return Err(StateError::InvalidStatus {
                    expected: "not blocked",
                    actual: row.status,
                });
            }

            let applied = self.clear_row(&mut *tx, &row, LockerStatus::Blocked).await?;
            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::LockerBlocked,
                    actor,
                    EventDetail::Blocked {
                        reason: reason.to_owned(),
                    },
                )
                .await?;
            let command = queue
                .enqueue_in(
                    &mut *tx,
                    kiosk_id,
                    crate::types::CommandPayload::BlockLocker {
                        locker_id,
                        reason: reason.to_owned(),
                    },
                    crate::commands::DEFAULT_MAX_RETRIES,
                )
                .await
                .map_err(|err| match err {
                    crate::error::QueueError::Storage(e) => StateError::Storage(e),
                    other => StateError::Storage(sqlx::Error::Protocol(other.to_string())),
                })?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Blocked, &event);

            let mut updated = row;
            updated.status = LockerStatus::Blocked;
            updated.owner_type = OwnerType::None;
            updated.owner_key = None;
            updated.reserved_at = None;
            updated.owned_at = None;
            updated.version += 1;
            return Ok((updated, command));
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Blocked → Free.
    pub async fn unblock(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status != LockerStatus::Blocked {
                return Err(StateError::InvalidStatus {
                    expected: "blocked",
                    actual: row.status,
                });
            }

            let applied = self.clear_row(&mut *tx, &row, LockerStatus::Free).await?;
            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::LockerUnblocked,
                    actor,
                    EventDetail::Empty,
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Free, &event);

            let mut updated = row;
            updated.status = LockerStatus::Free;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Owned → Opening, while the unlatch pulse is in flight. The
    /// `reserved_at` column doubles as the Opening entry timestamp so the
    /// timeout sweeper can find stuck rows.
    pub async fn mark_opening(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status != LockerStatus::Owned {
                return Err(StateError::InvalidStatus {
                    expected: "owned",
                    actual: row.status,
                });
            }

            let now = Utc::now();
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'opening', reserved_at = ?, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(now)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::OpeningStarted,
                    actor,
                    EventDetail::Empty,
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Opening, &event);

            let mut updated = row;
            updated.status = LockerStatus::Opening;
            updated.reserved_at = Some(now);
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Opening → Owned, after the pulse completed and ownership persists.
    pub async fn finish_opening(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.status != LockerStatus::Opening {
                return Err(StateError::InvalidStatus {
                    expected: "opening",
                    actual: row.status,
                });
            }

            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'owned', reserved_at = NULL, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::OpeningFinished,
                    actor,
                    EventDetail::Empty,
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Owned, &event);

            let mut updated = row;
            updated.status = LockerStatus::Owned;
            updated.reserved_at = None;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Bind a locker to a VIP contract: sets `is_vip`, owner `vip`, Owned.
    pub async fn bind_vip(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        rfid_card: &str,
        contract_id: &str,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if row.is_vip {
                return Err(StateError::VipBlocked {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                });
            }
            if row.status != LockerStatus::Free {
                return Err(StateError::InvalidStatus {
                    expected: "free",
                    actual: row.status,
                });
            }

            let now = Utc::now();
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = 'owned', owner_type = 'vip', owner_key = ?,
                      owned_at = ?, is_vip = 1, version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(rfid_card)
            .bind(now)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::VipAssign,
                    actor,
                    EventDetail::Vip {
                        contract_id: contract_id.to_owned(),
                        rfid_card: rfid_card.to_owned(),
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Owned, &event);

            let mut updated = row;
            updated.status = LockerStatus::Owned;
            updated.owner_type = OwnerType::Vip;
            updated.owner_key = Some(rfid_card.to_owned());
            updated.owned_at = Some(now);
            updated.is_vip = true;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Dissolve a VIP binding when its contract reaches a terminal state.
    /// A blocked locker stays blocked; otherwise it returns to Free.
    pub async fn clear_vip(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        contract_id: &str,
        actor: Actor<'_>,
    ) -> Result<Locker, StateError> {
        let lock = self.row_lock(kiosk_id, locker_id);
        let _guard = lock.lock().await;

        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = self.load(&mut *tx, kiosk_id, locker_id).await?;

            if !row.is_vip {
                return Err(StateError::InvalidStatus {
                    expected: "vip",
                    actual: row.status,
                });
            }

            let next = if row.status == LockerStatus::Blocked {
                LockerStatus::Blocked
            } else {
                LockerStatus::Free
            };
            let applied = sqlx::query(
                r"UPDATE lockers
                  SET status = ?, owner_type = 'none', owner_key = NULL,
                      reserved_at = NULL, owned_at = NULL, is_vip = 0,
                      version = version + 1
                  WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
            )
            .bind(next)
            .bind(kiosk_id)
            .bind(locker_id)
            .bind(row.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if applied == 0 {
                tx.rollback().await?;
                continue;
            }

            let rfid_card = row.owner_key.clone().unwrap_or_default();
            let event = self
                .emit(
                    &mut *tx,
                    kiosk_id,
                    locker_id,
                    EventType::VipRelease,
                    actor,
                    EventDetail::Vip {
                        contract_id: contract_id.to_owned(),
                        rfid_card,
                    },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, next, &event);

            let mut updated = row;
            updated.status = next;
            updated.owner_type = OwnerType::None;
            updated.owner_key = None;
            updated.reserved_at = None;
            updated.owned_at = None;
            updated.is_vip = false;
            updated.version += 1;
            return Ok(updated);
        }

        Err(StateError::Busy {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    // ── Sweepers ─────────────────────────────────────────────────────

    /// Return reservations older than `cutoff` to Free, one event each.
    pub async fn expire_reservations(&self, cutoff: DateTime<Utc>) -> Result<u64, StateError> {
        let candidates = sqlx::query_as::<_, Locker>(
            "SELECT * FROM lockers WHERE status = 'reserved' AND reserved_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0u64;
        for candidate in candidates {
            let lock = self.row_lock(&candidate.kiosk_id, candidate.locker_id);
            let _guard = lock.lock().await;

            let mut tx = self.pool.begin().await?;
            let row = match self
                .load(&mut *tx, &candidate.kiosk_id, candidate.locker_id)
                .await
            {
                Ok(row) => row,
                Err(StateError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            // Re-check under the lock: the user may have confirmed meanwhile.
            if row.status != LockerStatus::Reserved
                || row.reserved_at.is_none_or(|at| at >= cutoff)
            {
                continue;
            }

            let applied = self.clear_row(&mut *tx, &row, LockerStatus::Free).await?;
            if applied == 0 {
                continue;
            }

            let reserved_at = row.reserved_at.unwrap_or_else(Utc::now);
            let event = self
                .emit(
                    &mut *tx,
                    &row.kiosk_id,
                    row.locker_id,
                    EventType::ReservationExpired,
                    Actor::system(),
                    EventDetail::ReservationExpired { reserved_at },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, LockerStatus::Free, &event);
            expired += 1;
        }

        if expired > 0 {
            debug!(expired, "reservations expired");
        }
        Ok(expired)
    }

    /// Sweep lockers stuck in Opening past `cutoff` back to their prior
    /// state: Owned when the owner fields survive, otherwise Free.
    pub async fn sweep_opening(&self, cutoff: DateTime<Utc>) -> Result<u64, StateError> {
        let candidates = sqlx::query_as::<_, Locker>(
            "SELECT * FROM lockers WHERE status = 'opening' AND reserved_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut swept = 0u64;
        for candidate in candidates {
            let lock = self.row_lock(&candidate.kiosk_id, candidate.locker_id);
            let _guard = lock.lock().await;

            let mut tx = self.pool.begin().await?;
            let row = match self
                .load(&mut *tx, &candidate.kiosk_id, candidate.locker_id)
                .await
            {
                Ok(row) => row,
                Err(StateError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            };
            if row.status != LockerStatus::Opening
                || row.reserved_at.is_none_or(|at| at >= cutoff)
            {
                continue;
            }

            let reverted_to = if row.owner_key.is_some() {
                LockerStatus::Owned
            } else {
                LockerStatus::Free
            };

            let applied = if reverted_to == LockerStatus::Owned {
                sqlx::query(
                    r"UPDATE lockers
                      SET status = 'owned', reserved_at = NULL, version = version + 1
                      WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
                )
                .bind(&row.kiosk_id)
                .bind(row.locker_id)
                .bind(row.version)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            } else {
                self.clear_row(&mut *tx, &row, LockerStatus::Free).await?
            };
            if applied == 0 {
                continue;
            }

            let event = self
                .emit(
                    &mut *tx,
                    &row.kiosk_id,
                    row.locker_id,
                    EventType::OpeningTimeout,
                    Actor::system(),
                    EventDetail::OpeningTimeout { reverted_to },
                )
                .await?;
            tx.commit().await?;
            self.after_commit(&row, reverted_to, &event);
            swept += 1;
        }

        Ok(swept)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn row_lock(&self, kiosk_id: &str, locker_id: i64) -> Arc<Mutex<()>> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry((kiosk_id.to_owned(), locker_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        kiosk_id: &str,
        locker_id: i64,
    ) -> Result<Locker, StateError> {
        sqlx::query_as::<_, Locker>(
            "SELECT * FROM lockers WHERE kiosk_id = ? AND locker_id = ?",
        )
        .bind(kiosk_id)
        .bind(locker_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StateError::NotFound {
            kiosk_id: kiosk_id.to_owned(),
            locker_id,
        })
    }

    /// Clear owner fields and set the target status, version-checked.
    async fn clear_row(
        &self,
        conn: &mut SqliteConnection,
        row: &Locker,
        status: LockerStatus,
    ) -> Result<u64, StateError> {
        let applied = sqlx::query(
            r"UPDATE lockers
              SET status = ?, owner_type = 'none', owner_key = NULL,
                  reserved_at = NULL, owned_at = NULL, version = version + 1
              WHERE kiosk_id = ? AND locker_id = ? AND version = ?",
        )
        .bind(status)
        .bind(&row.kiosk_id)
        .bind(row.locker_id)
        .bind(row.version)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(applied)
    }

    async fn emit(
        &self,
        conn: &mut SqliteConnection,
        kiosk_id: &str,
        locker_id: i64,
        event_type: EventType,
        actor: Actor<'_>,
        detail: EventDetail,
    ) -> Result<crate::types::Event, StateError> {
        let mut event = NewEvent::new(event_type)
            .kiosk(kiosk_id)
            .locker(locker_id)
            .details(detail);
        if let Some(card) = actor.rfid_card {
            event = event.card(card);
        }
        if let Some(staff) = actor.staff_user {
            event = event.staff(staff);
        }
        let stored = self.events.append_in(&mut *conn, event).await?;
        Ok(stored)
    }

    fn after_commit(&self, before: &Locker, new: LockerStatus, event: &crate::types::Event) {
        self.events.publish(event);
        let _ = self.changes.send(StateChanged {
            kiosk_id: before.kiosk_id.clone(),
            locker_id: before.locker_id,
            old: before.status,
            new,
            version: before.version + 1,
        });
    }
}

fn assign_event(owner_type: OwnerType) -> EventType {
    match owner_type {
        OwnerType::Rfid => EventType::RfidAssign,
        OwnerType::Device => EventType::QrAssign,
        OwnerType::Vip => EventType::VipAssign,
        OwnerType::None => EventType::StaffAssign,
    }
}

fn release_event(owner_type: OwnerType) -> EventType {
    match owner_type {
        OwnerType::Rfid => EventType::RfidRelease,
        OwnerType::Device => EventType::QrRelease,
        OwnerType::Vip | OwnerType::None => EventType::StaffRelease,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn fixture() -> (StateStore, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let store = StateStore::new(&db, events.clone());
        store
            .ensure_lockers("kiosk-1", 8, &SystemConfig::default())
            .await
            .unwrap();
        (store, events)
    }

    #[tokio::test]
    async fn reserve_confirm_release_cycle() {
        let (store, _) = fixture().await;

        let reserved = store
            .reserve("kiosk-1", 3, OwnerType::Rfid, "abcd1234", Actor::card("0001"))
            .await
            .unwrap();
        assert_eq!(reserved.status, LockerStatus::Reserved);
        assert_eq!(reserved.version, 1);

        let owned = store.confirm("kiosk-1", 3, Actor::card("0001")).await.unwrap();
        assert_eq!(owned.status, LockerStatus::Owned);
        assert_eq!(owned.version, 2);

        let freed = store
            .release("kiosk-1", 3, Some("abcd1234"), Actor::card("0001"))
            .await
            .unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
        assert_eq!(freed.owner_type, OwnerType::None);
        assert!(freed.owner_key.is_none());
        assert_eq!(freed.version, 3);
    }

    #[tokio::test]
    async fn reserve_then_release_emits_exactly_two_events() {
        let (store, events) = fixture().await;

        store
            .reserve("kiosk-1", 1, OwnerType::Device, "deadbeef", Actor::system())
            .await
            .unwrap();
        store
            .release("kiosk-1", 1, None, Actor::system())
            .await
            .unwrap();

        let log = events.recent(10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].event_type, EventType::LockerReserved);
        assert_eq!(log[0].event_type, EventType::QrRelease);

        let locker = store.get("kiosk-1", 1).await.unwrap();
        assert_eq!(locker.status, LockerStatus::Free);
        assert_eq!(locker.version, 2);
    }

    #[tokio::test]
    async fn same_owner_cannot_reserve_two_lockers() {
        let (store, _) = fixture().await;

        store
            .reserve("kiosk-1", 1, OwnerType::Rfid, "key1", Actor::system())
            .await
            .unwrap();
        let err = store
            .reserve("kiosk-1", 2, OwnerType::Rfid, "key1", Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::OwnerAlreadyHasLocker { locker_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn reserve_rejects_non_free() {
        let (store, _) = fixture().await;
        store
            .reserve("kiosk-1", 1, OwnerType::Rfid, "key1", Actor::system())
            .await
            .unwrap();
        let err = store
            .reserve("kiosk-1", 1, OwnerType::Rfid, "key2", Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStatus { .. }));
    }

    #[tokio::test]
    async fn reserve_rejects_vip_locker() {
        let (store, _) = fixture().await;
        store
            .bind_vip("kiosk-1", 5, "vipcard", "contract-1", Actor::staff("ops"))
            .await
            .unwrap();
        let err = store
            .reserve("kiosk-1", 5, OwnerType::Rfid, "key1", Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::VipBlocked { .. }));
    }

    #[tokio::test]
    async fn release_checks_owner_key() {
        let (store, _) = fixture().await;
        store
            .reserve("kiosk-1", 1, OwnerType::Device, "dev-a", Actor::system())
            .await
            .unwrap();
        let err = store
            .release("kiosk-1", 1, Some("dev-b"), Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotOwner));
    }

    #[tokio::test]
    async fn vip_ownership_cannot_be_released_directly() {
        let (store, _) = fixture().await;
        store
            .bind_vip("kiosk-1", 2, "vipcard", "contract-1", Actor::staff("ops"))
            .await
            .unwrap();
        let err = store
            .release("kiosk-1", 2, None, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::VipProtected));
    }

    #[tokio::test]
    async fn block_clears_owner_fields() {
        let (store, _) = fixture().await;
        store
            .reserve("kiosk-1", 4, OwnerType::Rfid, "key4", Actor::system())
            .await
            .unwrap();
        let blocked = store
            .block("kiosk-1", 4, "door jammed", Actor::staff("ops"))
            .await
            .unwrap();
        assert_eq!(blocked.status, LockerStatus::Blocked);
        assert_eq!(blocked.owner_type, OwnerType::None);
        assert!(blocked.owner_key.is_none());

        let freed = store.unblock("kiosk-1", 4, Actor::staff("ops")).await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
    }

    #[tokio::test]
    async fn available_excludes_vip_and_taken() {
        let (store, _) = fixture().await;
        store
            .bind_vip("kiosk-1", 1, "vipcard", "c1", Actor::staff("ops"))
            .await
            .unwrap();
        store
            .reserve("kiosk-1", 2, OwnerType::Rfid, "key2", Actor::system())
            .await
            .unwrap();

        let available = store.available("kiosk-1", None).await.unwrap();
        let ids: Vec<i64> = available.iter().map(|l| l.locker_id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn lookup_by_owner_finds_the_single_row() {
        let (store, _) = fixture().await;
        store
            .reserve("kiosk-1", 6, OwnerType::Rfid, "findme", Actor::system())
            .await
            .unwrap();
        let hit = store
            .lookup_by_owner(OwnerType::Rfid, "findme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.locker_id, 6);
        assert!(store
            .lookup_by_owner(OwnerType::Rfid, "nobody")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reservation_expiry_boundary() {
        let (store, events) = fixture().await;
        store
            .reserve("kiosk-1", 1, OwnerType::Rfid, "key1", Actor::system())
            .await
            .unwrap();
        store
            .reserve("kiosk-1", 2, OwnerType::Rfid, "key2", Actor::system())
            .await
            .unwrap();

        let cutoff = Utc::now();
        // Locker 1 reserved just before the cutoff, locker 2 just after.
        sqlx::query("UPDATE lockers SET reserved_at = ? WHERE kiosk_id = 'kiosk-1' AND locker_id = 1")
            .bind(cutoff - Duration::milliseconds(1))
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE lockers SET reserved_at = ? WHERE kiosk_id = 'kiosk-1' AND locker_id = 2")
            .bind(cutoff + Duration::milliseconds(1))
            .execute(store.pool())
            .await
            .unwrap();

        let expired = store.expire_reservations(cutoff).await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            store.get("kiosk-1", 1).await.unwrap().status,
            LockerStatus::Free
        );
        assert_eq!(
            store.get("kiosk-1", 2).await.unwrap().status,
            LockerStatus::Reserved
        );

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::ReservationExpired);
        assert_eq!(log[0].locker_id, Some(1));
    }

    #[tokio::test]
    async fn opening_timeout_reverts_to_owned_when_owner_survives() {
        let (store, _) = fixture().await;
        store
            .assign_direct("kiosk-1", 3, OwnerType::Rfid, "key3", Actor::staff("ops"))
            .await
            .unwrap();
        store.mark_opening("kiosk-1", 3, Actor::system()).await.unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let swept = store.sweep_opening(cutoff).await.unwrap();
        assert_eq!(swept, 1);

        let locker = store.get("kiosk-1", 3).await.unwrap();
        assert_eq!(locker.status, LockerStatus::Owned);
        assert_eq!(locker.owner_key.as_deref(), Some("key3"));
    }

    #[tokio::test]
    async fn block_with_close_commits_state_and_command_together() {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let store = StateStore::new(&db, events.clone());
        let queue = crate::commands::CommandQueue::new(&db, events.clone());
        store
            .ensure_lockers("kiosk-1", 4, &SystemConfig::default())
            .await
            .unwrap();

        let (blocked, command) = store
            .block_with_close("kiosk-1", 2, "hinge damaged", Actor::staff("ops"), &queue)
            .await
            .unwrap();
        assert_eq!(blocked.status, LockerStatus::Blocked);
        assert_eq!(
            command.payload.0,
            crate::types::CommandPayload::BlockLocker {
                locker_id: 2,
                reason: "hinge damaged".to_owned(),
            }
        );
        assert_eq!(queue.pending_count("kiosk-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn state_changes_are_published_in_commit_order() {
        let (store, _) = fixture().await;
        let mut rx = store.subscribe_changes();

        store
            .reserve("kiosk-1", 7, OwnerType::Rfid, "key7", Actor::system())
            .await
            .unwrap();
        store.confirm("kiosk-1", 7, Actor::system()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(
            (first.old, first.new, first.version),
            (LockerStatus::Free, LockerStatus::Reserved, 1)
        );
        assert_eq!(
            (second.old, second.new, second.version),
            (LockerStatus::Reserved, LockerStatus::Owned, 2)
        );
    }

    impl StateStore {
        fn pool(&self) -> &SqlitePool {
            &self.pool
        }
    }
}
