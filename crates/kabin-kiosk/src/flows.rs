//! RFID user flow.
//!
//! A scan either opens the card's existing locker (releasing it for
//! ordinary users, leaving VIP ownership intact) or opens a 20-second
//! selection session listing the free lockers in this kiosk's zone. The
//! unlatch pulse sits between reserve and confirm: a failed pulse releases
//! the reservation so the locker never appears taken while still latched.

use chrono::Utc;

use kabin_core::config::ConfigManager;
use kabin_core::error::{EventError, HardwareError, StateError, UidError, ZoneError};
use kabin_core::events::EventLogger;
use kabin_core::rfid::{normalize_uid, owner_key, SessionManager};
use kabin_core::state::{Actor, StateStore};
use kabin_core::types::{EventDetail, EventType, NewEvent, OwnerType};
use kabin_core::zone::{self, CoilAddress};

use std::sync::Arc;

use crate::driver::RelayDriver;

/// Errors from the RFID flow, mapped to kiosk UI messages upstream.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    InvalidUid(#[from] UidError),

    /// The card has no open session on this kiosk (expired or never opened).
    #[error("no active session for this card")]
    NoSession,

    /// The selected locker was not in the session's offer.
    #[error("locker {locker_id} was not offered in this session")]
    NotOffered { locker_id: i64 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// What a scan resulted in.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Duplicate read within the debounce window; nothing happened.
    DuplicateIgnored,
    /// The card's locker was opened and released.
    Released { locker_id: i64 },
    /// A VIP locker was opened; ownership is untouched.
    VipOpened { locker_id: i64 },
    /// The card holds a locker on a different kiosk; nothing was pulsed.
    OtherKiosk { kiosk_id: String, locker_id: i64 },
    /// A selection session opened with these lockers on offer.
    SessionOpened { available: Vec<i64> },
}

/// Orchestrates scans and selections against the shared core.
#[derive(Clone)]
pub struct RfidFlow {
    state: StateStore,
    sessions: Arc<SessionManager>,
    driver: RelayDriver,
    config: Arc<ConfigManager>,
    events: EventLogger,
    kiosk_id: String,
    kiosk_zone: Option<String>,
}

impl RfidFlow {
    #[must_use]
    pub fn new(
        state: StateStore,
        sessions: Arc<SessionManager>,
        driver: RelayDriver,
        config: Arc<ConfigManager>,
        events: EventLogger,
        kiosk_id: String,
        kiosk_zone: Option<String>,
    ) -> Self {
        Self {
            state,
            sessions,
            driver,
            config,
            events,
            kiosk_id,
            kiosk_zone,
        }
    }

    /// Handle a card scan.
    pub async fn handle_scan(&self, raw_uid: &str) -> Result<ScanOutcome, FlowError> {
        let card = normalize_uid(raw_uid)?;
        let now = Utc::now();
        if self.sessions.debounced(&self.kiosk_id, &card, now) {
            return Ok(ScanOutcome::DuplicateIgnored);
        }
        let key = owner_key(&card);

        // VIP bindings store the card itself as the owner key.
        if let Some(locker) = self.state.lookup_by_owner(OwnerType::Vip, &card).await? {
            if locker.kiosk_id != self.kiosk_id {
                return Ok(ScanOutcome::OtherKiosk {
                    kiosk_id: locker.kiosk_id,
                    locker_id: locker.locker_id,
                });
            }
            let coil = self.resolve(locker.locker_id).await?;
            return match self.driver.pulse(coil).await {
                Ok(()) => {
                    self.events
                        .append(
                            NewEvent::new(EventType::VipAccess)
                                .kiosk(&self.kiosk_id)
                                .locker(locker.locker_id)
                                .card(&card),
                        )
                        .await?;
                    Ok(ScanOutcome::VipOpened {
                        locker_id: locker.locker_id,
                    })
                }
                Err(err) => {
                    self.hardware_event(&err, locker.locker_id, &card).await?;
                    Err(err.into())
                }
            };
        }

        if let Some(locker) = self.state.lookup_by_owner(OwnerType::Rfid, &key).await? {
            if locker.kiosk_id != self.kiosk_id {
                return Ok(ScanOutcome::OtherKiosk {
                    kiosk_id: locker.kiosk_id,
                    locker_id: locker.locker_id,
                });
            }
            let coil = self.resolve(locker.locker_id).await?;
            return match self.driver.pulse(coil).await {
                Ok(()) => {
                    self.state
                        .release(&self.kiosk_id, locker.locker_id, Some(&key), Actor::card(&card))
                        .await?;
                    Ok(ScanOutcome::Released {
                        locker_id: locker.locker_id,
                    })
                }
                Err(err) => {
                    // Ownership survives a failed open.
                    self.hardware_event(&err, locker.locker_id, &card).await?;
                    Err(err.into())
                }
            };
        }

        // Fresh card: open a selection session over the zone's free lockers.
        let snapshot = self.config.snapshot().await;
        let zone = self
            .kiosk_zone
            .as_deref()
            .filter(|_| snapshot.features.zones_enabled)
            .and_then(|id| snapshot.zone(id))
            .filter(|z| z.enabled);
        let available: Vec<i64> = self
            .state
            .available(&self.kiosk_id, zone)
            .await?
            .iter()
            .map(|l| l.locker_id)
            .collect();

        let session = self
            .sessions
            .open(&self.kiosk_id, &card, &key, available, now)
            .await?;
        Ok(ScanOutcome::SessionOpened {
            available: session.available,
        })
    }

    /// Handle the user's locker choice inside an open session.
    pub async fn handle_selection(&self, raw_uid: &str, locker_id: i64) -> Result<i64, FlowError> {
        let card = normalize_uid(raw_uid)?;
        let now = Utc::now();
        let session = self
            .sessions
            .take(&self.kiosk_id, &card, now)
            .ok_or(FlowError::NoSession)?;
        if !session.available.contains(&locker_id) {
            return Err(FlowError::NotOffered { locker_id });
        }

        let coil = self.resolve(locker_id).await?;
        self.state
            .reserve(
                &self.kiosk_id,
                locker_id,
                OwnerType::Rfid,
                &session.owner_key,
                Actor::card(&card),
            )
            .await?;

        match self.driver.pulse(coil).await {
            Ok(()) => {
                self.state
                    .confirm(&self.kiosk_id, locker_id, Actor::card(&card))
                    .await?;
                Ok(locker_id)
            }
            Err(err) => {
                self.state
                    .release(
                        &self.kiosk_id,
                        locker_id,
                        Some(&session.owner_key),
                        Actor::card(&card),
                    )
                    .await?;
                self.hardware_event(&err, locker_id, &card).await?;
                Err(err.into())
            }
        }
    }

    async fn resolve(&self, locker_id: i64) -> Result<CoilAddress, FlowError> {
        let snapshot = self.config.snapshot().await;
        Ok(zone::resolve(&snapshot, locker_id)?)
    }

    async fn hardware_event(
        &self,
        err: &HardwareError,
        locker_id: i64,
        card: &str,
    ) -> Result<(), FlowError> {
        self.events
            .append(
                NewEvent::new(EventType::HardwareError)
                    .kiosk(&self.kiosk_id)
                    .locker(locker_id)
                    .card(card)
                    .details(EventDetail::Hardware {
                        kind: err.kind,
                        slave_address: err.slave_address,
                        channel: err.channel,
                        message: err.to_string(),
                    }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LoopbackPort};
    use crate::driver::{DriverSettings, RelayDriver};
    use kabin_core::config::SystemConfig;
    use kabin_core::types::LockerStatus;
    use kabin_store::Db;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn flow() -> (RfidFlow, StateStore, crate::bus::LoopbackHandle, TempDir) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let state = StateStore::new(&db, events.clone());
        state
            .ensure_lockers("kiosk-1", 32, &SystemConfig::default())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigManager::load(dir.path().join("system.json"))
                .await
                .unwrap(),
        );

        let (port, handle) = LoopbackPort::new();
        let driver = RelayDriver::spawn(
            Box::new(port),
            DriverSettings {
                pulse_duration: Duration::from_millis(1),
                inter_command_gap: Duration::from_millis(0),
                retry_backoff: Duration::from_millis(1),
                ..DriverSettings::default()
            },
        );

        let sessions = Arc::new(SessionManager::new(events.clone()));
        let flow = RfidFlow::new(
            state.clone(),
            sessions,
            driver,
            config,
            events,
            "kiosk-1".to_owned(),
            None,
        );
        (flow, state, handle, dir)
    }

    #[tokio::test]
    async fn scan_select_scan_again_releases() {
        let (flow, state, handle, _dir) = flow().await;

        let outcome = flow.handle_scan("0009652489").await.unwrap();
        let available = match outcome {
            ScanOutcome::SessionOpened { available } => available,
            other => unreachable!("expected session, got {other:?}"),
        };
        assert_eq!(available.len(), 32);

        let assigned = flow.handle_selection("0009652489", 7).await.unwrap();
        assert_eq!(assigned, 7);
        assert_eq!(
            state.get("kiosk-1", 7).await.unwrap().status,
            LockerStatus::Owned
        );
        // Pulse on the legacy mapping: slave 1, channel 7.
        let sent = handle.sent();
        assert_eq!(sent[0][0], 1);
        assert_eq!(u16::from(sent[0][3]), 6);

        // Debounce would eat an immediate second scan; bypass it by
        // waiting out the window in logical time is not possible here, so
        // scan with a fresh session manager path: the same card after the
        // debounce window releases the locker.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let outcome = flow.handle_scan("0009652489").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::Released { locker_id: 7 }));
        assert_eq!(
            state.get("kiosk-1", 7).await.unwrap().status,
            LockerStatus::Free
        );
    }

    #[tokio::test]
    async fn duplicate_scan_is_ignored() {
        let (flow, _, _, _dir) = flow().await;
        flow.handle_scan("0009652489").await.unwrap();
        let second = flow.handle_scan("0009652489").await.unwrap();
        assert!(matches!(second, ScanOutcome::DuplicateIgnored));
    }

    #[tokio::test]
    async fn failed_pulse_rolls_back_the_reservation() {
        let (flow, state, handle, _dir) = flow().await;
        flow.handle_scan("0009652489").await.unwrap();

        // Every attempt of the ON write times out.
        for _ in 0..3 {
            handle.inject_failure(BusError::Timeout);
        }
        let err = flow.handle_selection("0009652489", 5).await.unwrap_err();
        assert!(matches!(err, FlowError::Hardware(_)));
        assert_eq!(
            state.get("kiosk-1", 5).await.unwrap().status,
            LockerStatus::Free
        );
    }

    #[tokio::test]
    async fn vip_scan_opens_without_releasing() {
        let (flow, state, _, _dir) = flow().await;
        state
            .bind_vip("kiosk-1", 3, "0006851540", "contract-1", Actor::staff("ops"))
            .await
            .unwrap();

        let outcome = flow.handle_scan("0006851540").await.unwrap();
        assert!(matches!(outcome, ScanOutcome::VipOpened { locker_id: 3 }));
        let locker = state.get("kiosk-1", 3).await.unwrap();
        assert_eq!(locker.status, LockerStatus::Owned);
        assert!(locker.is_vip);
    }

    #[tokio::test]
    async fn selection_outside_the_offer_is_rejected() {
        let (flow, state, _, _dir) = flow().await;
        state
            .block("kiosk-1", 9, "broken", Actor::staff("ops"))
            .await
            .unwrap();
        flow.handle_scan("0009652489").await.unwrap();

        let err = flow.handle_selection("0009652489", 9).await.unwrap_err();
        assert!(matches!(err, FlowError::NotOffered { locker_id: 9 }));
    }

    #[tokio::test]
    async fn selection_without_a_session_fails() {
        let (flow, _, _, _dir) = flow().await;
        let err = flow.handle_selection("0009652489", 1).await.unwrap_err();
        assert!(matches!(err, FlowError::NoSession));
    }
}
