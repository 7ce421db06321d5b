//! Durable per-kiosk command queue.
//!
//! FIFO with at-least-once delivery. Kiosks long-poll the gateway, which
//! calls [`CommandQueue::poll`] — the only operation that moves commands
//! `pending → in_progress` — inside a single transaction, so two pollers can
//! never lease the same command. Failed commands are rescheduled with
//! exponential backoff until the retry budget is spent; a lease sweeper
//! recovers commands from kiosks that crashed mid-operation.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;

use kabin_store::Db;

use crate::error::QueueError;
use crate::events::EventLogger;
use crate::types::{Command, CommandPayload, CommandStatus, EventDetail, EventType, NewEvent};

/// Default retry budget for a freshly enqueued command.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// First reschedule delay; doubles per failure.
const BACKOFF_BASE_SECS: i64 = 5;

/// Reschedule delay ceiling.
const BACKOFF_CAP_SECS: i64 = 300;

/// Durable command queue manager. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    pool: SqlitePool,
    events: EventLogger,
}

impl CommandQueue {
    #[must_use]
    pub fn new(db: &Db, events: EventLogger) -> Self {
        Self {
            pool: db.pool().clone(),
            events,
        }
    }

    /// Enqueue a command for a kiosk.
    pub async fn enqueue(
        &self,
        kiosk_id: &str,
        payload: CommandPayload,
        max_retries: i64,
    ) -> Result<Command, QueueError> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_in(&mut *conn, kiosk_id, payload, max_retries)
            .await
    }

    /// Enqueue on a caller-owned connection or transaction, so a state
    /// mutation and its advisory command commit atomically.
    pub async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        kiosk_id: &str,
        payload: CommandPayload,
        max_retries: i64,
    ) -> Result<Command, QueueError> {
        let now = Utc::now();
        let command = Command {
            command_id: Uuid::new_v4(),
            kiosk_id: kiosk_id.to_owned(),
            kind: payload.kind(),
            payload: Json(payload),
            status: CommandStatus::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            scheduled_at: now,
            lease_expires_at: None,
            completed_at: None,
            last_error: None,
        };

        sqlx::query(
            r"INSERT INTO commands
                (command_id, kiosk_id, kind, payload, status, attempts, max_retries,
                 created_at, scheduled_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(command.command_id)
        .bind(&command.kiosk_id)
        .bind(command.kind)
        .bind(&command.payload)
        .bind(command.status)
        .bind(command.attempts)
        .bind(command.max_retries)
        .bind(command.created_at)
        .bind(command.scheduled_at)
        .execute(conn)
        .await?;

        info!(command_id = %command.command_id, kiosk_id, kind = %command.kind, "command enqueued");
        Ok(command)
    }

    /// Fetch a command by id.
    pub async fn get(&self, command_id: Uuid) -> Result<Command, QueueError> {
        sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE command_id = ?")
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| QueueError::NotFound {
                command_id: command_id.to_string(),
            })
    }

    /// Lease up to `max_batch` due commands for a kiosk, oldest scheduled
    /// first, atomically transitioning them to `in_progress`.
    pub async fn poll(
        &self,
        kiosk_id: &str,
        max_batch: i64,
        lease: Duration,
    ) -> Result<Vec<Command>, QueueError> {
        let now = Utc::now();
        let lease_expires_at = now + lease;

        let mut tx = self.pool.begin().await?;
        let mut leased = sqlx::query_as::<_, Command>(
            r"SELECT * FROM commands
              WHERE kiosk_id = ? AND status = 'pending' AND scheduled_at <= ?
              ORDER BY scheduled_at, created_at
              LIMIT ?",
        )
        .bind(kiosk_id)
        .bind(now)
        .bind(max_batch)
        .fetch_all(&mut *tx)
        .await?;

        for command in &mut leased {
            sqlx::query(
                r"UPDATE commands
                  SET status = 'in_progress', lease_expires_at = ?
                  WHERE command_id = ?",
            )
            .bind(lease_expires_at)
            .bind(command.command_id)
            .execute(&mut *tx)
            .await?;
            command.status = CommandStatus::InProgress;
            command.lease_expires_at = Some(lease_expires_at);
        }
        tx.commit().await?;

        Ok(leased)
    }

    /// Mark a leased command as executed.
    pub async fn mark_complete(&self, command_id: Uuid) -> Result<(), QueueError> {
        let command = self.get(command_id).await?;
        if command.status != CommandStatus::InProgress {
            return Err(QueueError::InvalidStatus {
                command_id: command_id.to_string(),
                status: command.status,
                operation: "complete",
            });
        }

        sqlx::query(
            r"UPDATE commands
              SET status = 'completed', completed_at = ?, lease_expires_at = NULL
              WHERE command_id = ? AND status = 'in_progress'",
        )
        .bind(Utc::now())
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed execution. While the retry budget lasts, the command
    /// is rescheduled with exponential backoff; afterwards it is terminal.
    pub async fn mark_failed(&self, command_id: Uuid, error: &str) -> Result<Command, QueueError> {
        let command = self.get(command_id).await?;
        if command.status != CommandStatus::InProgress {
            return Err(QueueError::InvalidStatus {
                command_id: command_id.to_string(),
                status: command.status,
                operation: "fail",
            });
        }

        let attempts = command.attempts + 1;
        if attempts > command.max_retries {
            sqlx::query(
                r"UPDATE commands
                  SET status = 'failed', attempts = ?, last_error = ?,
                      completed_at = ?, lease_expires_at = NULL
                  WHERE command_id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(Utc::now())
            .bind(command_id)
            .execute(&self.pool)
            .await?;
            warn!(%command_id, attempts, error, "command failed terminally");
        } else {
            let delay = backoff(attempts);
            sqlx::query(
                r"UPDATE commands
                  SET status = 'pending', attempts = ?, last_error = ?,
                      scheduled_at = ?, lease_expires_at = NULL
                  WHERE command_id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(Utc::now() + delay)
            .bind(command_id)
            .execute(&self.pool)
            .await?;
            info!(%command_id, attempts, error, "command rescheduled");
        }

        self.get(command_id).await
    }

    /// Cancel a command that has not been delivered yet.
    pub async fn cancel(&self, command_id: Uuid) -> Result<(), QueueError> {
        let command = self.get(command_id).await?;
        if command.status != CommandStatus::Pending {
            return Err(QueueError::InvalidStatus {
                command_id: command_id.to_string(),
                status: command.status,
                operation: "cancel",
            });
        }
        sqlx::query("UPDATE commands SET status = 'cancelled' WHERE command_id = ? AND status = 'pending'")
            .bind(command_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop every pending and in-flight command for a kiosk — called when
    /// the kiosk reports a restart, so it never replays stale work. Emits
    /// one `commands_cleared` event with the count.
    pub async fn clear(&self, kiosk_id: &str) -> Result<u64, QueueError> {
        let mut tx = self.pool.begin().await?;
        let cleared = sqlx::query(
            r"UPDATE commands
              SET status = 'cancelled', lease_expires_at = NULL
              WHERE kiosk_id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(kiosk_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let event = self
            .events
            .append_in(
                &mut *tx,
                NewEvent::new(EventType::CommandsCleared)
                    .kiosk(kiosk_id)
                    .details(EventDetail::CommandsCleared { count: cleared }),
            )
            .await
            .map_err(|crate::error::EventError::Storage(e)| QueueError::Storage(e))?;
        tx.commit().await?;
        self.events.publish(&event);

        info!(kiosk_id, cleared, "command queue cleared");
        Ok(cleared)
    }

    /// Return expired leases to `pending`, spending one attempt each; a
    /// command whose budget is gone becomes terminal `failed`.
    pub async fn sweep_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let expired = sqlx::query_as::<_, Command>(
            r"SELECT * FROM commands
              WHERE status = 'in_progress' AND lease_expires_at < ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for command in expired {
            let attempts = command.attempts + 1;
            if attempts > command.max_retries {
                sqlx::query(
                    r"UPDATE commands
                      SET status = 'failed', attempts = ?, last_error = 'lease expired',
                          completed_at = ?, lease_expires_at = NULL
                      WHERE command_id = ? AND status = 'in_progress'",
                )
                .bind(attempts)
                .bind(now)
                .bind(command.command_id)
                .execute(&self.pool)
                .await?;
                warn!(command_id = %command.command_id, "leased command abandoned, failed terminally");
            } else {
                sqlx::query(
                    r"UPDATE commands
                      SET status = 'pending', attempts = ?, last_error = 'lease expired',
                          scheduled_at = ?, lease_expires_at = NULL
                      WHERE command_id = ? AND status = 'in_progress'",
                )
                .bind(attempts)
                .bind(now)
                .bind(command.command_id)
                .execute(&self.pool)
                .await?;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Count of undelivered commands for a kiosk.
    pub async fn pending_count(&self, kiosk_id: &str) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM commands WHERE kiosk_id = ? AND status = 'pending'",
        )
        .bind(kiosk_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn backoff(attempts: i64) -> Duration {
    let exp = (attempts - 1).clamp(0, 16) as u32;
    let secs = (BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS);
    Duration::seconds(secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn queue() -> (CommandQueue, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        (CommandQueue::new(&db, events.clone()), events)
    }

    fn open(locker_id: i64) -> CommandPayload {
        CommandPayload::OpenLocker {
            locker_id,
            reason: None,
        }
    }

    #[tokio::test]
    async fn enqueue_poll_complete_drains_the_queue() {
        let (queue, _) = queue().await;
        let command = queue.enqueue("gym-main", open(7), DEFAULT_MAX_RETRIES).await.unwrap();

        let leased = queue.poll("gym-main", 10, Duration::seconds(60)).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].command_id, command.command_id);
        assert_eq!(leased[0].status, CommandStatus::InProgress);

        // Leased commands are invisible to a second poll.
        assert!(queue.poll("gym-main", 10, Duration::seconds(60)).await.unwrap().is_empty());

        queue.mark_complete(command.command_id).await.unwrap();
        assert_eq!(queue.pending_count("gym-main").await.unwrap(), 0);
        assert_eq!(
            queue.get(command.command_id).await.unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test]
    async fn poll_respects_kiosk_and_order() {
        let (queue, _) = queue().await;
        queue.enqueue("a", open(1), 3).await.unwrap();
        queue.enqueue("b", open(2), 3).await.unwrap();
        queue.enqueue("a", open(3), 3).await.unwrap();

        let leased = queue.poll("a", 10, Duration::seconds(60)).await.unwrap();
        let lockers: Vec<Option<i64>> = leased.iter().map(|c| c.payload.locker_id()).collect();
        assert_eq!(lockers, vec![Some(1), Some(3)]);
    }

    #[tokio::test]
    async fn failed_command_is_rescheduled_with_backoff() {
        let (queue, _) = queue().await;
        let command = queue.enqueue("k", open(1), 3).await.unwrap();
        queue.poll("k", 1, Duration::seconds(60)).await.unwrap();

        let failed = queue.mark_failed(command.command_id, "timeout").await.unwrap();
        assert_eq!(failed.status, CommandStatus::Pending);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert!(failed.scheduled_at > Utc::now());
    }

    #[tokio::test]
    async fn command_is_terminal_after_retry_budget() {
        let (queue, _) = queue().await;
        let command = queue.enqueue("k", open(1), 1).await.unwrap();

        for _ in 0..2 {
            // Force the reschedule to be due immediately so poll sees it.
            sqlx::query("UPDATE commands SET scheduled_at = ? WHERE command_id = ?")
                .bind(Utc::now())
                .bind(command.command_id)
                .execute(&queue.pool)
                .await
                .unwrap();
            let leased = queue.poll("k", 1, Duration::seconds(60)).await.unwrap();
            assert_eq!(leased.len(), 1);
            queue.mark_failed(command.command_id, "still broken").await.unwrap();
        }

        let terminal = queue.get(command.command_id).await.unwrap();
        assert_eq!(terminal.status, CommandStatus::Failed);
        assert_eq!(terminal.attempts, 2);
    }

    #[tokio::test]
    async fn clear_cancels_pending_and_in_flight() {
        let (queue, events) = queue().await;
        queue.enqueue("gym-main", open(1), 3).await.unwrap();
        queue.enqueue("gym-main", open(2), 3).await.unwrap();
        queue.poll("gym-main", 1, Duration::seconds(60)).await.unwrap();

        let cleared = queue.clear("gym-main").await.unwrap();
        assert_eq!(cleared, 2);
        assert_eq!(queue.pending_count("gym-main").await.unwrap(), 0);

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::CommandsCleared);
    }

    #[tokio::test]
    async fn lease_sweeper_recovers_crashed_kiosk_work() {
        let (queue, _) = queue().await;
        let command = queue.enqueue("k", open(1), 3).await.unwrap();
        queue.poll("k", 1, Duration::seconds(1)).await.unwrap();

        let later = Utc::now() + Duration::seconds(5);
        let recovered = queue.sweep_leases(later).await.unwrap();
        assert_eq!(recovered, 1);

        let refreshed = queue.get(command.command_id).await.unwrap();
        assert_eq!(refreshed.status, CommandStatus::Pending);
        assert_eq!(refreshed.attempts, 1);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending() {
        let (queue, _) = queue().await;
        let command = queue.enqueue("k", open(1), 3).await.unwrap();
        queue.poll("k", 1, Duration::seconds(60)).await.unwrap();
        let err = queue.cancel(command.command_id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidStatus { .. }));
    }
}
