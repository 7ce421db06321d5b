//! End-to-end scenarios over the core managers with an in-memory store.

#![allow(clippy::unwrap_used)]

use chrono::{Duration, Utc};
use uuid::Uuid;

use kabin_core::commands::{CommandQueue, DEFAULT_MAX_RETRIES};
use kabin_core::config::{
    ConfigManager, Features, Hardware, LockerRange, RelayCard, SystemConfig, ZoneConfig,
};
use kabin_core::events::{EventFilter, EventLogger};
use kabin_core::rfid::{normalize_uid, owner_key, SessionManager};
use kabin_core::state::{Actor, StateStore};
use kabin_core::types::{
    CommandPayload, CommandStatus, EventDetail, EventType, LockerStatus, NewEvent, OwnerType,
};
use kabin_core::zone;
use kabin_store::Db;

async fn core() -> (Db, EventLogger, StateStore) {
    let db = Db::open_in_memory().await.unwrap();
    let events = EventLogger::new(&db);
    let state = StateStore::new(&db, events.clone());
    (db, events, state)
}

fn relay_card(addr: u8) -> RelayCard {
    RelayCard {
        slave_address: addr,
        channels: 16,
        card_type: "relay16".to_owned(),
        description: String::new(),
        enabled: true,
    }
}

/// RFID happy path with zones disabled: scan, pick locker 7, scan again to
/// release.
#[tokio::test]
async fn rfid_assign_and_release_cycle() {
    let (_db, events, state) = core().await;
    state
        .ensure_lockers("kiosk-1", 32, &SystemConfig::default())
        .await
        .unwrap();
    let sessions = SessionManager::new(events.clone());

    let card = normalize_uid("0009652489").unwrap();
    let key = owner_key(&card);
    let now = Utc::now();

    // First scan: nothing held, a session opens with all 32 lockers.
    assert!(state
        .lookup_by_owner(OwnerType::Rfid, &key)
        .await
        .unwrap()
        .is_none());
    let available = state.available("kiosk-1", None).await.unwrap();
    assert_eq!(available.len(), 32);
    let session = sessions
        .open(
            "kiosk-1",
            &card,
            &key,
            available.iter().map(|l| l.locker_id).collect(),
            now,
        )
        .await
        .unwrap();
    assert_eq!(session.available.len(), 32);

    // The user picks locker 7 inside the window.
    let taken = sessions.take("kiosk-1", &card, now + Duration::seconds(5)).unwrap();
    assert!(taken.available.contains(&7));
    state
        .reserve("kiosk-1", 7, OwnerType::Rfid, &key, Actor::card(&card))
        .await
        .unwrap();
    state.confirm("kiosk-1", 7, Actor::card(&card)).await.unwrap();

    let assigned = events
        .query(&EventFilter {
            event_type: Some(EventType::RfidAssign),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].rfid_card.as_deref(), Some(card.as_str()));
    assert_eq!(assigned[0].locker_id, Some(7));

    // Second scan: lookup finds locker 7, pulse succeeds, release.
    let held = state
        .lookup_by_owner(OwnerType::Rfid, &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.locker_id, 7);
    state
        .release("kiosk-1", 7, Some(&key), Actor::card(&card))
        .await
        .unwrap();

    let locker = state.get("kiosk-1", 7).await.unwrap();
    assert_eq!(locker.status, LockerStatus::Free);
    let released = events
        .query(&EventFilter {
            event_type: Some(EventType::RfidRelease),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
}

/// Adding a relay card extends the last enabled zone and grows the locker
/// table; zone filters follow the new ranges.
#[tokio::test]
async fn zone_extension_grows_the_installation() {
    let (_db, _events, state) = core().await;

    let initial = SystemConfig {
        config_version: 1,
        features: Features {
            zones_enabled: true,
            emergency_open_enabled: false,
        },
        hardware: Hardware {
            relay_cards: vec![relay_card(1), relay_card(2), relay_card(3), relay_card(4)],
        },
        zones: vec![
            ZoneConfig {
                id: "mens".to_owned(),
                name: "Erkek".to_owned(),
                enabled: true,
                ranges: vec![LockerRange(1, 32)],
                relay_cards: vec![1, 2],
            },
            ZoneConfig {
                id: "womens".to_owned(),
                name: "Kadın".to_owned(),
                enabled: true,
                ranges: vec![LockerRange(33, 64)],
                relay_cards: vec![3, 4],
            },
        ],
        lockers: vec![],
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("system.json");
    tokio::fs::write(&path, serde_json::to_vec(&initial).unwrap())
        .await
        .unwrap();
    let config = ConfigManager::load(&path).await.unwrap();

    let extension = config
        .register_relay_cards(vec![relay_card(5)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(extension.zone, "womens");
    assert_eq!(extension.ranges, vec![LockerRange(33, 80)]);

    let snapshot = config.snapshot().await;
    assert_eq!(snapshot.zone("womens").unwrap().relay_cards, vec![3, 4, 5]);

    // The locker table grows to the new capacity.
    state
        .ensure_lockers("kiosk-1", i64::from(snapshot.total_capacity()), &snapshot)
        .await
        .unwrap();
    assert_eq!(state.all("kiosk-1").await.unwrap().len(), 80);

    // Zone filters track the rebalanced ranges.
    let mens = zone::require_zone(&snapshot, "mens").unwrap();
    let in_mens = state.available("kiosk-1", Some(mens)).await.unwrap();
    assert!(in_mens.iter().all(|l| (1..=32).contains(&l.locker_id)));
    assert_eq!(in_mens.len(), 32);

    let womens = zone::require_zone(&snapshot, "womens").unwrap();
    let in_womens = state.available("kiosk-1", Some(womens)).await.unwrap();
    assert!(in_womens.iter().all(|l| (33..=80).contains(&l.locker_id)));
    assert_eq!(in_womens.len(), 48);

    assert!(zone::require_zone(&snapshot, "unknown").is_err());
}

/// Kiosk restart clears its queue without opening anything.
#[tokio::test]
async fn restart_clears_pending_commands() {
    let (db, events, _state) = core().await;
    let queue = CommandQueue::new(&db, events.clone());

    queue
        .enqueue(
            "gym-main",
            CommandPayload::OpenLocker {
                locker_id: 3,
                reason: None,
            },
            DEFAULT_MAX_RETRIES,
        )
        .await
        .unwrap();
    let second = queue
        .enqueue(
            "gym-main",
            CommandPayload::CloseLocker { locker_id: 4 },
            DEFAULT_MAX_RETRIES,
        )
        .await
        .unwrap();

    // Heartbeat arrives with the restart marker: the gateway clears the
    // queue and records why.
    let cleared = queue.clear("gym-main").await.unwrap();
    assert_eq!(cleared, 2);
    events
        .append(
            NewEvent::new(EventType::Restarted)
                .kiosk("gym-main")
                .details(EventDetail::Restarted {
                    cleared_commands: cleared,
                    reason: "power_interruption".to_owned(),
                }),
        )
        .await
        .unwrap();

    assert_eq!(queue.pending_count("gym-main").await.unwrap(), 0);
    assert_eq!(
        queue.get(second.command_id).await.unwrap().status,
        CommandStatus::Cancelled
    );

    let restarted = events
        .query(&EventFilter {
            event_type: Some(EventType::Restarted),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(restarted.len(), 1);
}

/// Fifty concurrent assignments with distinct keys all commit; ownership
/// stays unique and consistent.
#[tokio::test]
async fn concurrent_assignment_is_consistent() {
    let (_db, _events, state) = core().await;
    state
        .ensure_lockers("kiosk-1", 50, &SystemConfig::default())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..50i64 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key-{i:02}");
            state
                .reserve("kiosk-1", i + 1, OwnerType::Rfid, &key, Actor::system())
                .await?;
            state.confirm("kiosk-1", i + 1, Actor::system()).await?;
            Ok::<_, kabin_core::error::StateError>(())
        }));
    }

    let mut confirmed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            confirmed += 1;
        }
    }
    assert_eq!(confirmed, 50);

    let lockers = state.all("kiosk-1").await.unwrap();
    let owned: Vec<_> = lockers
        .iter()
        .filter(|l| l.status == LockerStatus::Owned)
        .collect();
    assert_eq!(owned.len(), confirmed);

    // No two rows share an owner key.
    let mut keys: Vec<_> = owned.iter().filter_map(|l| l.owner_key.clone()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), owned.len());

    // Every row is internally consistent.
    for locker in &lockers {
        assert_eq!(
            locker.status.has_owner(),
            locker.owner_key.is_some(),
            "locker {} in {:?} with owner {:?}",
            locker.locker_id,
            locker.status,
            locker.owner_key
        );
    }
}

/// The same locker contested by many owners admits exactly one.
#[tokio::test]
async fn contested_locker_has_one_winner() {
    let (_db, _events, state) = core().await;
    state
        .ensure_lockers("kiosk-1", 1, &SystemConfig::default())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..20i64 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("contender-{i:02}");
            state
                .reserve("kiosk-1", 1, OwnerType::Device, &key, Actor::system())
                .await
                .is_ok()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let locker = state.get("kiosk-1", 1).await.unwrap();
    assert_eq!(locker.status, LockerStatus::Reserved);
    assert_eq!(locker.version, 1);
}

/// A VIP contract's id round-trips through the uuid type used in storage.
#[tokio::test]
async fn command_ids_are_uuids() {
    let (db, events, _state) = core().await;
    let queue = CommandQueue::new(&db, events);
    let command = queue
        .enqueue(
            "k",
            CommandPayload::Buzzer { pattern: None },
            DEFAULT_MAX_RETRIES,
        )
        .await
        .unwrap();
    let parsed = Uuid::parse_str(&command.command_id.to_string()).unwrap();
    assert_eq!(parsed, command.command_id);
}
