//! Kiosk provisioning: one-shot enrollment tokens and derived secrets.
//!
//! Staff mint a token bound to a zone; the kiosk redeems it once within
//! 30 minutes, presenting its hardware id. The server derives
//! `registration_secret = HMAC-SHA-256(secret_key, "kiosk_id:hardware_id:secret_key")`
//! and the kiosk authenticates every later request with it. Verification
//! re-derives and compares constant-time; the hardware id must match on
//! every request.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::sqlite::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use kabin_store::Db;

use crate::error::ProvisioningError;
use crate::events::EventLogger;
use crate::heartbeat::HeartbeatManager;
use crate::types::{EventDetail, EventType, NewEvent, ProvisioningToken};

type HmacSha256 = Hmac<Sha256>;

/// One-shot token lifetime.
pub const TOKEN_TTL_MINUTES: i64 = 30;

/// A successful redemption.
#[derive(Debug, Clone)]
pub struct Registration {
    pub kiosk_id: String,
    pub registration_secret: String,
}

/// Issues, redeems, and verifies kiosk enrollment credentials.
#[derive(Clone)]
pub struct Provisioner {
    pool: SqlitePool,
    events: EventLogger,
    heartbeats: HeartbeatManager,
    secret: Vec<u8>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}

impl Provisioner {
    /// `secret` is the deployment's `PROVISIONING_SECRET`.
    #[must_use]
    pub fn new(db: &Db, events: EventLogger, heartbeats: HeartbeatManager, secret: &[u8]) -> Self {
        Self {
            pool: db.pool().clone(),
            events,
            heartbeats,
            secret: secret.to_vec(),
        }
    }

    /// Mint a one-shot token with a preallocated kiosk id.
    pub async fn issue(&self, zone: Option<&str>) -> Result<ProvisioningToken, ProvisioningError> {
        let token = ProvisioningToken {
            token: Uuid::new_v4().simple().to_string(),
            kiosk_id: format!("kiosk-{}", &Uuid::new_v4().simple().to_string()[..8]),
            zone: zone.map(str::to_owned),
            expires_at: Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES),
            used: false,
            used_at: None,
        };

        sqlx::query(
            r"INSERT INTO provisioning_tokens (token, kiosk_id, zone, expires_at, used)
              VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&token.token)
        .bind(&token.kiosk_id)
        .bind(&token.zone)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;

        info!(kiosk_id = %token.kiosk_id, zone = ?token.zone, "provisioning token issued");
        Ok(token)
    }

    /// Redeem a token: mark it used, derive the registration secret, and
    /// create the kiosk's heartbeat row in `provisioning` state.
    pub async fn redeem(
        &self,
        token: &str,
        hardware_id: &str,
        zone: Option<&str>,
        version: Option<&str>,
    ) -> Result<Registration, ProvisioningError> {
        let row = sqlx::query_as::<_, ProvisioningToken>(
            "SELECT * FROM provisioning_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ProvisioningError::UnknownToken)?;

        if row.used {
            return Err(ProvisioningError::TokenUsed);
        }
        if row.expires_at < Utc::now() {
            return Err(ProvisioningError::TokenExpired);
        }

        // One-shot: the conditional update loses cleanly if two kiosks race.
        let claimed = sqlx::query(
            "UPDATE provisioning_tokens SET used = 1, used_at = ? WHERE token = ? AND used = 0",
        )
        .bind(Utc::now())
        .bind(token)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Err(ProvisioningError::TokenUsed);
        }

        let registration_secret = self.derive(&row.kiosk_id, hardware_id);
        let zone = zone.or(row.zone.as_deref());
        self.heartbeats
            .register(&row.kiosk_id, zone, hardware_id, &registration_secret, version)
            .await
            .map_err(|err| match err {
                crate::error::HeartbeatError::Storage(e) => ProvisioningError::Storage(e),
                crate::error::HeartbeatError::UnknownKiosk { kiosk_id } => {
                    ProvisioningError::UnknownKiosk { kiosk_id }
                }
            })?;

        self.events
            .append(
                NewEvent::new(EventType::Provisioned)
                    .kiosk(&row.kiosk_id)
                    .details(EventDetail::Provisioned {
                        zone: zone.map(str::to_owned),
                        hardware_id: hardware_id.to_owned(),
                    }),
            )
            .await
            .map_err(|crate::error::EventError::Storage(e)| ProvisioningError::Storage(e))?;

        info!(kiosk_id = %row.kiosk_id, hardware_id, "kiosk provisioned");
        Ok(Registration {
            kiosk_id: row.kiosk_id,
            registration_secret,
        })
    }

    /// Authenticate a kiosk request: the hardware id must match the one
    /// seen at registration, and the presented secret must equal the
    /// re-derived one under constant-time comparison.
    pub async fn verify(
        &self,
        kiosk_id: &str,
        hardware_id: &str,
        presented_secret: &str,
    ) -> Result<(), ProvisioningError> {
        let row = self.heartbeats.get(kiosk_id).await.map_err(|err| match err {
            crate::error::HeartbeatError::Storage(e) => ProvisioningError::Storage(e),
            crate::error::HeartbeatError::UnknownKiosk { kiosk_id } => {
                ProvisioningError::UnknownKiosk { kiosk_id }
            }
        })?;

        if row.hardware_id != hardware_id {
            return Err(ProvisioningError::HardwareMismatch {
                kiosk_id: kiosk_id.to_owned(),
            });
        }

        let expected = self.derive(kiosk_id, hardware_id);
        if expected
            .as_bytes()
            .ct_eq(presented_secret.as_bytes())
            .unwrap_u8()
            != 1
        {
            return Err(ProvisioningError::InvalidSecret {
                kiosk_id: kiosk_id.to_owned(),
            });
        }
        Ok(())
    }

    /// Flip the kiosk's heartbeat row to `online` once enrollment is done.
    pub async fn complete_enrollment(&self, kiosk_id: &str) -> Result<(), ProvisioningError> {
        self.heartbeats
            .complete_enrollment(kiosk_id)
            .await
            .map_err(|err| match err {
                crate::error::HeartbeatError::Storage(e) => ProvisioningError::Storage(e),
                crate::error::HeartbeatError::UnknownKiosk { kiosk_id } => {
                    ProvisioningError::UnknownKiosk { kiosk_id }
                }
            })
    }

    /// Delete unused tokens whose window has passed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ProvisioningError> {
        let purged = sqlx::query(
            "DELETE FROM provisioning_tokens WHERE used = 0 AND expires_at < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(purged)
    }

    fn derive(&self, kiosk_id: &str, hardware_id: &str) -> String {
        #[allow(clippy::unwrap_used)] // HMAC accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        mac.update(kiosk_id.as_bytes());
        mac.update(b":");
        mac.update(hardware_id.as_bytes());
        mac.update(b":");
        mac.update(&self.secret);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::KioskStatus;

    async fn provisioner() -> (Provisioner, HeartbeatManager) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let heartbeats = HeartbeatManager::new(&db, events.clone());
        (
            Provisioner::new(&db, events, heartbeats.clone(), b"provisioning-secret"),
            heartbeats,
        )
    }

    #[tokio::test]
    async fn issue_redeem_verify_enroll() {
        let (provisioner, heartbeats) = provisioner().await;
        let token = provisioner.issue(Some("mens")).await.unwrap();

        let registration = provisioner
            .redeem(&token.token, "hw-01", None, Some("1.0.0"))
            .await
            .unwrap();
        assert_eq!(registration.kiosk_id, token.kiosk_id);

        provisioner
            .verify(&registration.kiosk_id, "hw-01", &registration.registration_secret)
            .await
            .unwrap();

        provisioner
            .complete_enrollment(&registration.kiosk_id)
            .await
            .unwrap();
        let row = heartbeats.get(&registration.kiosk_id).await.unwrap();
        assert_eq!(row.status, KioskStatus::Online);
        assert_eq!(row.zone.as_deref(), Some("mens"));
    }

    #[tokio::test]
    async fn tokens_are_one_shot() {
        let (provisioner, _) = provisioner().await;
        let token = provisioner.issue(None).await.unwrap();
        provisioner.redeem(&token.token, "hw-01", None, None).await.unwrap();

        let err = provisioner
            .redeem(&token.token, "hw-02", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::TokenUsed));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected_and_purged() {
        let (provisioner, _) = provisioner().await;
        let token = provisioner.issue(None).await.unwrap();
        sqlx::query("UPDATE provisioning_tokens SET expires_at = ? WHERE token = ?")
            .bind(Utc::now() - Duration::minutes(1))
            .bind(&token.token)
            .execute(&provisioner.pool)
            .await
            .unwrap();

        let err = provisioner
            .redeem(&token.token, "hw-01", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::TokenExpired));

        assert_eq!(provisioner.purge_expired(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (provisioner, _) = provisioner().await;
        let err = provisioner
            .redeem("no-such-token", "hw-01", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::UnknownToken));
    }

    #[tokio::test]
    async fn wrong_secret_or_hardware_fails_verification() {
        let (provisioner, _) = provisioner().await;
        let token = provisioner.issue(None).await.unwrap();
        let registration = provisioner
            .redeem(&token.token, "hw-01", None, None)
            .await
            .unwrap();

        let err = provisioner
            .verify(&registration.kiosk_id, "hw-01", "forged")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidSecret { .. }));

        let err = provisioner
            .verify(&registration.kiosk_id, "hw-99", &registration.registration_secret)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::HardwareMismatch { .. }));
    }
}
