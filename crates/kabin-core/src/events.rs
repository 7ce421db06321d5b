//! Append-only event log.
//!
//! Every state transition lands here with fields sufficient for forensic
//! review. `seq` comes from SQLite AUTOINCREMENT, so it is strictly
//! increasing even under concurrent writers. Each appended event is also
//! published on a broadcast channel for push transports; channel delivery
//! is best-effort — the database row is authoritative.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tokio::sync::broadcast;
use tracing::debug;

use kabin_store::Db;

use crate::error::EventError;
use crate::types::{Event, EventType, NewEvent};

/// Capacity of the broadcast channel. Slow subscribers lag and lose
/// messages rather than blocking writers.
const CHANNEL_CAPACITY: usize = 256;

/// Appends and queries audit events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventLogger {
    pool: SqlitePool,
    sender: broadcast::Sender<Event>,
}

/// Filter for event queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i64>,
    pub rfid_card: Option<String>,
    pub staff_user: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl EventLogger {
    #[must_use]
    pub fn new(db: &Db) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            pool: db.pool().clone(),
            sender,
        }
    }

    /// Subscribe to the live event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Append one event in its own transaction and publish it.
    pub async fn append(&self, event: NewEvent) -> Result<Event, EventError> {
        let mut conn = self.pool.acquire().await?;
        let stored = self.append_in(&mut *conn, event).await?;
        drop(conn);
        self.publish(&stored);
        Ok(stored)
    }

    /// Append several events inside one transaction, publishing after
    /// commit in insertion order.
    pub async fn append_all(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EventError> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            stored.push(self.append_in(&mut *tx, event).await?);
        }
        tx.commit().await?;
        for event in &stored {
            self.publish(event);
        }
        Ok(stored)
    }

    /// Append on a caller-owned connection or transaction. The caller is
    /// responsible for committing and then calling [`Self::publish`] — a
    /// rolled-back event must never reach subscribers.
    pub async fn append_in(
        &self,
        conn: &mut SqliteConnection,
        event: NewEvent,
    ) -> Result<Event, EventError> {
        let ts = Utc::now();
        let details = Json(event.details.clone());
        let seq: i64 = sqlx::query_scalar(
            r"INSERT INTO events (ts, kiosk_id, locker_id, event_type, rfid_card, staff_user, details)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              RETURNING seq",
        )
        .bind(ts)
        .bind(&event.kiosk_id)
        .bind(event.locker_id)
        .bind(event.event_type)
        .bind(&event.rfid_card)
        .bind(&event.staff_user)
        .bind(&details)
        .fetch_one(conn)
        .await?;

        debug!(seq, event_type = %event.event_type, "event appended");

        Ok(Event {
            seq,
            ts,
            kiosk_id: event.kiosk_id,
            locker_id: event.locker_id,
            event_type: event.event_type,
            rfid_card: event.rfid_card,
            staff_user: event.staff_user,
            details,
        })
    }

    /// Best-effort push to subscribers.
    pub fn publish(&self, event: &Event) {
        let _ = self.sender.send(event.clone());
    }

    /// Query the log, newest first.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, EventError> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM events WHERE 1=1");

        if let Some(kiosk_id) = &filter.kiosk_id {
            builder.push(" AND kiosk_id = ").push_bind(kiosk_id);
        }
        if let Some(locker_id) = filter.locker_id {
            builder.push(" AND locker_id = ").push_bind(locker_id);
        }
        if let Some(rfid_card) = &filter.rfid_card {
            builder.push(" AND rfid_card = ").push_bind(rfid_card);
        }
        if let Some(staff_user) = &filter.staff_user {
            builder.push(" AND staff_user = ").push_bind(staff_user);
        }
        if let Some(event_type) = filter.event_type {
            builder.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(since) = filter.since {
            builder.push(" AND ts >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            builder.push(" AND ts < ").push_bind(until);
        }

        builder.push(" ORDER BY seq DESC");
        builder.push(" LIMIT ").push_bind(filter.limit.unwrap_or(200));

        let events = builder.build_query_as::<Event>().fetch_all(&self.pool).await?;
        Ok(events)
    }

    /// The `n` most recent events, newest first.
    pub async fn recent(&self, n: i64) -> Result<Vec<Event>, EventError> {
        self.query(&EventFilter {
            limit: Some(n),
            ..EventFilter::default()
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::EventDetail;

    async fn logger() -> EventLogger {
        let db = Db::open_in_memory().await.unwrap();
        EventLogger::new(&db)
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let logger = logger().await;
        let a = logger
            .append(NewEvent::new(EventType::KioskOnline).kiosk("k1"))
            .await
            .unwrap();
        let b = logger
            .append(NewEvent::new(EventType::KioskOffline).kiosk("k1"))
            .await
            .unwrap();
        assert!(b.seq > a.seq);
    }

    #[tokio::test]
    async fn append_all_is_one_batch() {
        let logger = logger().await;
        let stored = logger
            .append_all(vec![
                NewEvent::new(EventType::BulkOpen).kiosk("k1").locker(1),
                NewEvent::new(EventType::BulkOpen).kiosk("k1").locker(2),
                NewEvent::new(EventType::BulkOpen).kiosk("k1").locker(3),
            ])
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    #[tokio::test]
    async fn filters_narrow_results() {
        let logger = logger().await;
        logger
            .append(
                NewEvent::new(EventType::RfidAssign)
                    .kiosk("k1")
                    .locker(7)
                    .card("0009652489"),
            )
            .await
            .unwrap();
        logger
            .append(NewEvent::new(EventType::RfidRelease).kiosk("k2").locker(3))
            .await
            .unwrap();

        let hits = logger
            .query(&EventFilter {
                rfid_card: Some("0009652489".to_owned()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kiosk_id.as_deref(), Some("k1"));

        let misses = logger
            .query(&EventFilter {
                kiosk_id: Some("k3".to_owned()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let logger = logger().await;
        for locker in 1..=5 {
            logger
                .append(NewEvent::new(EventType::StaffOpen).kiosk("k1").locker(locker))
                .await
                .unwrap();
        }
        let recent = logger.recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].locker_id, Some(5));
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let logger = logger().await;
        let mut rx = logger.subscribe();
        logger
            .append(
                NewEvent::new(EventType::HardwareError)
                    .kiosk("k1")
                    .details(EventDetail::Note {
                        message: "probe".to_owned(),
                    }),
            )
            .await
            .unwrap();
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.event_type, EventType::HardwareError);
    }
}
