//! RFID card handling: UID normalization and selection sessions.
//!
//! Card UIDs arrive as strings from the reader driver (debounced upstream
//! for hardware bounce; a second 1 s software debounce here drops double
//! reads). The stored owner key is a truncated SHA-256 of the normalized
//! UID, so the raw card number never lands in the lockers table.
//!
//! Sessions are in-memory state records with explicit deadlines: one per
//! kiosk, swept by a single background task rather than one timer per
//! session. A process restart invalidates all of them, by design of the
//! flow — the user simply scans again.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{EventError, UidError};
use crate::events::EventLogger;
use crate::types::{EventDetail, EventType, NewEvent};

/// Seconds a user has to pick a locker after scanning.
pub const SESSION_TIMEOUT_SECS: i64 = 20;

/// Duplicate scans of the same card within this window are dropped.
pub const SCAN_DEBOUNCE_MS: i64 = 1_000;

/// Minimum significant (non-leading-zero) digits in a card UID.
const MIN_SIGNIFICANT: usize = 4;

/// Normalize a raw card UID: trim, uppercase, hex digits only, leading
/// zeros preserved. All-zero and too-short UIDs are rejected.
///
/// # Errors
///
/// [`UidError::Empty`], [`UidError::InvalidCharacter`], or
/// [`UidError::ShortUid`].
pub fn normalize_uid(raw: &str) -> Result<String, UidError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UidError::Empty);
    }
    if let Some(bad) = trimmed.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(UidError::InvalidCharacter(bad));
    }

    let normalized = trimmed.to_ascii_uppercase();
    let significant = normalized.trim_start_matches('0').len();
    if significant < MIN_SIGNIFICANT {
        return Err(UidError::ShortUid { significant });
    }
    Ok(normalized)
}

/// The owner key stored for a card: the first 16 hex characters of the
/// SHA-256 of its normalized UID.
#[must_use]
pub fn owner_key(normalized_uid: &str) -> String {
    let digest = Sha256::digest(normalized_uid.as_bytes());
    hex::encode(digest)[..16].to_owned()
}

/// A 20-second window during which a scanned card may pick one locker.
#[derive(Debug, Clone)]
pub struct RfidSession {
    pub kiosk_id: String,
    pub rfid_card: String,
    pub owner_key: String,
    pub available: Vec<i64>,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// One selection session per kiosk, in memory only.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, RfidSession>>,
    last_scan: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    events: EventLogger,
}

impl SessionManager {
    #[must_use]
    pub fn new(events: EventLogger) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            last_scan: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Returns true when this scan is a duplicate inside the debounce
    /// window and should be dropped. Records the scan time otherwise.
    pub fn debounced(&self, kiosk_id: &str, rfid_card: &str, now: DateTime<Utc>) -> bool {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let mut last_scan = self.last_scan.lock().unwrap();
        let key = (kiosk_id.to_owned(), rfid_card.to_owned());
        if let Some(&previous) = last_scan.get(&key) {
            if now - previous < Duration::milliseconds(SCAN_DEBOUNCE_MS) {
                return true;
            }
        }
        last_scan.insert(key, now);
        false
    }

    /// Open a session for a card on a kiosk. Any prior session on the
    /// same kiosk is cancelled first with a `session_cancelled` event.
    pub async fn open(
        &self,
        kiosk_id: &str,
        rfid_card: &str,
        owner_key: &str,
        available: Vec<i64>,
        now: DateTime<Utc>,
    ) -> Result<RfidSession, EventError> {
        let session = RfidSession {
            kiosk_id: kiosk_id.to_owned(),
            rfid_card: rfid_card.to_owned(),
            owner_key: owner_key.to_owned(),
            available,
            opened_at: now,
            deadline: now + Duration::seconds(SESSION_TIMEOUT_SECS),
        };

        let cancelled = {
            #[allow(clippy::unwrap_used)]
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(kiosk_id.to_owned(), session.clone())
        };

        if let Some(previous) = cancelled {
            debug!(kiosk_id, card = %previous.rfid_card, "prior session cancelled");
            self.events
                .append(
                    NewEvent::new(EventType::SessionCancelled)
                        .kiosk(kiosk_id)
                        .card(&previous.rfid_card)
                        .details(EventDetail::Session {
                            rfid_card: previous.rfid_card.clone(),
                        }),
                )
                .await?;
        }

        Ok(session)
    }

    /// Consume the kiosk's session if it belongs to this card and is
    /// still inside its deadline.
    pub fn take(&self, kiosk_id: &str, rfid_card: &str, now: DateTime<Utc>) -> Option<RfidSession> {
        #[allow(clippy::unwrap_used)]
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(kiosk_id) {
            Some(session) if session.rfid_card == rfid_card && session.deadline >= now => {
                sessions.remove(kiosk_id)
            }
            _ => None,
        }
    }

    /// The kiosk's current session, if any.
    pub fn peek(&self, kiosk_id: &str) -> Option<RfidSession> {
        #[allow(clippy::unwrap_used)]
        let sessions = self.sessions.lock().unwrap();
        sessions.get(kiosk_id).cloned()
    }

    /// Drop sessions past their deadline, emitting `session_expired` for
    /// each. No locker state changes — nothing was reserved yet.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, EventError> {
        let expired: Vec<RfidSession> = {
            #[allow(clippy::unwrap_used)]
            let mut sessions = self.sessions.lock().unwrap();
            let dead: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.deadline < now)
                .map(|(k, _)| k.clone())
                .collect();
            dead.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        for session in &expired {
            self.events
                .append(
                    NewEvent::new(EventType::SessionExpired)
                        .kiosk(&session.kiosk_id)
                        .card(&session.rfid_card)
                        .details(EventDetail::Session {
                            rfid_card: session.rfid_card.clone(),
                        }),
                )
                .await?;
        }

        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kabin_store::Db;

    #[test]
    fn uid_with_leading_zeros_is_preserved() {
        assert_eq!(normalize_uid("0006851540").unwrap(), "0006851540");
        assert_eq!(normalize_uid(" 0009652489 ").unwrap(), "0009652489");
    }

    #[test]
    fn all_zero_uid_is_short() {
        assert_eq!(
            normalize_uid("00000000").unwrap_err(),
            UidError::ShortUid { significant: 0 }
        );
    }

    #[test]
    fn hex_uids_are_uppercased() {
        assert_eq!(normalize_uid("04a3b2c1").unwrap(), "04A3B2C1");
    }

    #[test]
    fn invalid_characters_are_rejected() {
        assert_eq!(
            normalize_uid("0006-8515").unwrap_err(),
            UidError::InvalidCharacter('-')
        );
        assert_eq!(normalize_uid("   ").unwrap_err(), UidError::Empty);
    }

    #[test]
    fn owner_key_is_16_hex_chars_and_stable() {
        let key = owner_key("0009652489");
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, owner_key("0009652489"));
        assert_ne!(key, owner_key("0009652488"));
    }

    async fn manager() -> (SessionManager, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        (SessionManager::new(events.clone()), events)
    }

    #[tokio::test]
    async fn duplicate_scans_inside_a_second_are_dropped() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        assert!(!manager.debounced("k1", "0001111122", now));
        assert!(manager.debounced("k1", "0001111122", now + Duration::milliseconds(500)));
        assert!(!manager.debounced("k1", "0001111122", now + Duration::milliseconds(1_100)));
    }

    #[tokio::test]
    async fn new_session_cancels_the_previous_one() {
        let (manager, events) = manager().await;
        let now = Utc::now();
        manager
            .open("k1", "0001111122", "key-a", vec![1, 2], now)
            .await
            .unwrap();
        manager
            .open("k1", "0009652489", "key-b", vec![1, 2], now)
            .await
            .unwrap();

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::SessionCancelled);
        assert_eq!(log[0].rfid_card.as_deref(), Some("0001111122"));

        // Only the new card can consume the session.
        assert!(manager.take("k1", "0001111122", now).is_none());
        assert!(manager.take("k1", "0009652489", now).is_some());
    }

    #[tokio::test]
    async fn take_respects_the_deadline() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        manager
            .open("k1", "0009652489", "key", vec![7], now)
            .await
            .unwrap();

        let late = now + Duration::seconds(SESSION_TIMEOUT_SECS + 1);
        assert!(manager.take("k1", "0009652489", late).is_none());
    }

    #[tokio::test]
    async fn sweep_emits_session_expired() {
        let (manager, events) = manager().await;
        let now = Utc::now();
        manager
            .open("k1", "0009652489", "key", vec![7], now)
            .await
            .unwrap();

        let later = now + Duration::seconds(SESSION_TIMEOUT_SECS + 1);
        assert_eq!(manager.sweep_expired(later).await.unwrap(), 1);
        assert!(manager.peek("k1").is_none());

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::SessionExpired);
    }
}
