//! VIP contract lifecycle.
//!
//! A VIP contract gives one RFID card exclusive long-term ownership of one
//! locker. Creating a contract binds the locker (`is_vip`, owner `vip`,
//! Owned); any terminal transition — cancellation or the end date passing —
//! clears the binding back to Free. User flows never dissolve VIP ownership;
//! only this module does.
//!
//! The VIP guard itself is just the `is_vip` column on the locker row, so
//! the state store never needs to call back into contract storage.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::info;
use uuid::Uuid;

use kabin_store::Db;

use crate::error::VipError;
use crate::rfid::normalize_uid;
use crate::state::{Actor, StateStore};
use crate::types::{VipContract, VipContractStatus};

/// Parameters for creating a contract.
#[derive(Debug, Clone)]
pub struct NewVipContract {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub rfid_card: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_by: String,
}

/// Manages VIP contracts and their locker bindings. Cheap to clone.
#[derive(Debug, Clone)]
pub struct VipContracts {
    pool: SqlitePool,
    state: StateStore,
}

impl VipContracts {
    #[must_use]
    pub fn new(db: &Db, state: StateStore) -> Self {
        Self {
            pool: db.pool().clone(),
            state,
        }
    }

    /// Create a contract and bind its locker.
    ///
    /// # Errors
    ///
    /// Rejects bad dates, unparseable cards, cards that already hold an
    /// active contract, and lockers that are not free. A failed binding
    /// removes the just-inserted contract row.
    pub async fn create(&self, new: NewVipContract) -> Result<VipContract, VipError> {
        if new.end_date <= new.start_date {
            return Err(VipError::InvalidDates);
        }
        let rfid_card = normalize_uid(&new.rfid_card)?;

        if let Some(existing) = self.active_for_card(&rfid_card).await? {
            return Err(VipError::CardAlreadyBound {
                rfid_card: existing.rfid_card,
            });
        }

        let contract = VipContract {
            id: Uuid::new_v4(),
            kiosk_id: new.kiosk_id.clone(),
            locker_id: new.locker_id,
            rfid_card: rfid_card.clone(),
            start_date: new.start_date,
            end_date: new.end_date,
            status: VipContractStatus::Active,
            created_by: new.created_by.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r"INSERT INTO vip_contracts
                (id, kiosk_id, locker_id, rfid_card, start_date, end_date,
                 status, created_by, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(contract.id)
        .bind(&contract.kiosk_id)
        .bind(contract.locker_id)
        .bind(&contract.rfid_card)
        .bind(contract.start_date)
        .bind(contract.end_date)
        .bind(contract.status)
        .bind(&contract.created_by)
        .bind(contract.created_at)
        .execute(&self.pool)
        .await?;

        let bound = self
            .state
            .bind_vip(
                &new.kiosk_id,
                new.locker_id,
                &rfid_card,
                &contract.id.to_string(),
                Actor::staff(&new.created_by),
            )
            .await;

        if let Err(err) = bound {
            // An active contract must always reference a bound locker.
            sqlx::query("DELETE FROM vip_contracts WHERE id = ?")
                .bind(contract.id)
                .execute(&self.pool)
                .await?;
            return Err(err.into());
        }

        info!(contract_id = %contract.id, kiosk_id = %contract.kiosk_id,
              locker_id = contract.locker_id, "VIP contract created");
        Ok(contract)
    }

    /// Cancel a contract and free its locker.
    pub async fn cancel(&self, id: Uuid, staff_user: &str) -> Result<VipContract, VipError> {
        let contract = self.get(id).await?;
        if contract.status != VipContractStatus::Active {
            return Err(VipError::NotActive {
                id: id.to_string(),
                status: contract.status.to_string(),
            });
        }

        sqlx::query("UPDATE vip_contracts SET status = 'cancelled' WHERE id = ? AND status = 'active'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.state
            .clear_vip(
                &contract.kiosk_id,
                contract.locker_id,
                &id.to_string(),
                Actor::staff(staff_user),
            )
            .await?;

        info!(contract_id = %id, "VIP contract cancelled");
        self.get(id).await
    }

    /// Expire contracts whose end date has passed, freeing their lockers.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, VipError> {
        let expired = sqlx::query_as::<_, VipContract>(
            "SELECT * FROM vip_contracts WHERE status = 'active' AND end_date < ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut count = 0u64;
        for contract in expired {
            let applied = sqlx::query(
                "UPDATE vip_contracts SET status = 'expired' WHERE id = ? AND status = 'active'",
            )
            .bind(contract.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if applied == 0 {
                continue;
            }

            self.state
                .clear_vip(
                    &contract.kiosk_id,
                    contract.locker_id,
                    &contract.id.to_string(),
                    Actor::system(),
                )
                .await?;
            info!(contract_id = %contract.id, "VIP contract expired");
            count += 1;
        }
        Ok(count)
    }

    /// Fetch one contract.
    pub async fn get(&self, id: Uuid) -> Result<VipContract, VipError> {
        sqlx::query_as::<_, VipContract>("SELECT * FROM vip_contracts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VipError::ContractNotFound { id: id.to_string() })
    }

    /// The active contract bound to a locker, if any.
    pub async fn active_for_locker(
        &self,
        kiosk_id: &str,
        locker_id: i64,
    ) -> Result<Option<VipContract>, VipError> {
        let contract = sqlx::query_as::<_, VipContract>(
            r"SELECT * FROM vip_contracts
              WHERE kiosk_id = ? AND locker_id = ? AND status = 'active'
              LIMIT 1",
        )
        .bind(kiosk_id)
        .bind(locker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    /// The active contract for a card, if any.
    pub async fn active_for_card(&self, rfid_card: &str) -> Result<Option<VipContract>, VipError> {
        let contract = sqlx::query_as::<_, VipContract>(
            "SELECT * FROM vip_contracts WHERE rfid_card = ? AND status = 'active' LIMIT 1",
        )
        .bind(rfid_card)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    /// All contracts, newest first, for the staff panel.
    pub async fn list(&self) -> Result<Vec<VipContract>, VipError> {
        let contracts = sqlx::query_as::<_, VipContract>(
            "SELECT * FROM vip_contracts ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(contracts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::events::EventLogger;
    use crate::types::{EventType, LockerStatus, OwnerType};
    use chrono::Duration;

    async fn fixture() -> (VipContracts, StateStore, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let state = StateStore::new(&db, events.clone());
        state
            .ensure_lockers("kiosk-1", 8, &SystemConfig::default())
            .await
            .unwrap();
        (VipContracts::new(&db, state.clone()), state, events)
    }

    fn contract_for(locker_id: i64, card: &str) -> NewVipContract {
        NewVipContract {
            kiosk_id: "kiosk-1".to_owned(),
            locker_id,
            rfid_card: card.to_owned(),
            start_date: Utc::now(),
            end_date: Utc::now() + Duration::days(90),
            created_by: "ops".to_owned(),
        }
    }

    #[tokio::test]
    async fn create_binds_the_locker() {
        let (vip, state, _) = fixture().await;
        let contract = vip.create(contract_for(5, "0006851540")).await.unwrap();
        assert_eq!(contract.status, VipContractStatus::Active);

        let locker = state.get("kiosk-1", 5).await.unwrap();
        assert!(locker.is_vip);
        assert_eq!(locker.status, LockerStatus::Owned);
        assert_eq!(locker.owner_type, OwnerType::Vip);
        assert_eq!(locker.owner_key.as_deref(), Some("0006851540"));
    }

    #[tokio::test]
    async fn one_card_one_contract() {
        let (vip, _, _) = fixture().await;
        vip.create(contract_for(1, "0006851540")).await.unwrap();
        let err = vip.create(contract_for(2, "0006851540")).await.unwrap_err();
        assert!(matches!(err, VipError::CardAlreadyBound { .. }));
    }

    #[tokio::test]
    async fn failed_binding_removes_the_contract() {
        let (vip, state, _) = fixture().await;
        state
            .reserve("kiosk-1", 3, OwnerType::Rfid, "taken", Actor::system())
            .await
            .unwrap();

        let err = vip.create(contract_for(3, "0006851540")).await.unwrap_err();
        assert!(matches!(err, VipError::State(_)));
        assert!(vip.active_for_card("0006851540").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_frees_the_locker() {
        let (vip, state, events) = fixture().await;
        let contract = vip.create(contract_for(5, "0006851540")).await.unwrap();

        let cancelled = vip.cancel(contract.id, "ops").await.unwrap();
        assert_eq!(cancelled.status, VipContractStatus::Cancelled);

        let locker = state.get("kiosk-1", 5).await.unwrap();
        assert!(!locker.is_vip);
        assert_eq!(locker.status, LockerStatus::Free);
        assert_eq!(locker.owner_type, OwnerType::None);

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::VipRelease);
    }

    #[tokio::test]
    async fn expiry_sweep_frees_lockers() {
        let (vip, state, _) = fixture().await;
        let mut new = contract_for(2, "0006851540");
        new.end_date = new.start_date + Duration::seconds(1);
        vip.create(new).await.unwrap();

        let later = Utc::now() + Duration::days(1);
        assert_eq!(vip.sweep_expired(later).await.unwrap(), 1);
        assert!(!state.get("kiosk-1", 2).await.unwrap().is_vip);
    }

    #[tokio::test]
    async fn invalid_dates_are_rejected() {
        let (vip, _, _) = fixture().await;
        let mut new = contract_for(1, "0006851540");
        new.end_date = new.start_date - Duration::days(1);
        assert!(matches!(
            vip.create(new).await.unwrap_err(),
            VipError::InvalidDates
        ));
    }
}
