//! Staff audit trail.
//!
//! Every staff operation produces a `staff_audit` event with the acting
//! user, the touched resource, and the request context. Hardware command
//! executions additionally land in the `command_log` table with timing and
//! outcome, so a failed open can be traced from the panel click to the bus
//! error.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use kabin_store::Db;

use crate::error::EventError;
use crate::events::EventLogger;
use crate::types::{CommandKind, CommandLogEntry, Event, EventDetail, EventType, NewEvent};

/// One staff operation to record.
#[derive(Debug, Clone)]
pub struct StaffAction {
    pub user: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

/// One command execution to record.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command_id: String,
    pub kiosk_id: String,
    pub locker_id: Option<i64>,
    pub kind: CommandKind,
    pub issued_by: String,
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// Writes staff audit events and command-log rows. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StaffAudit {
    pool: SqlitePool,
    events: EventLogger,
}

impl StaffAudit {
    #[must_use]
    pub fn new(db: &Db, events: EventLogger) -> Self {
        Self {
            pool: db.pool().clone(),
            events,
        }
    }

    /// Record a staff operation as a `staff_audit` event.
    pub async fn record(&self, action: StaffAction) -> Result<Event, EventError> {
        info!(user = %action.user, action = %action.action,
              resource = %action.resource_id, "staff operation");

        self.events
            .append(
                NewEvent::new(EventType::StaffAudit)
                    .staff(&action.user)
                    .details(EventDetail::StaffAudit {
                        action: action.action,
                        resource_type: action.resource_type,
                        resource_id: action.resource_id,
                        ip: action.ip,
                        user_agent: action.user_agent,
                        session_id: action.session_id,
                        details: action.details,
                    }),
            )
            .await
    }

    /// Record a command execution outcome.
    pub async fn log_command(&self, result: CommandResult) -> Result<(), EventError> {
        sqlx::query(
            r"INSERT INTO command_log
                (command_id, kiosk_id, locker_id, kind, issued_by, success,
                 message, error, execution_time_ms, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.command_id)
        .bind(&result.kiosk_id)
        .bind(result.locker_id)
        .bind(result.kind)
        .bind(&result.issued_by)
        .bind(result.success)
        .bind(&result.message)
        .bind(&result.error)
        .bind(result.execution_time_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent command-log rows for a kiosk, newest first.
    pub async fn command_log(
        &self,
        kiosk_id: &str,
        limit: i64,
    ) -> Result<Vec<CommandLogEntry>, EventError> {
        let entries = sqlx::query_as::<_, CommandLogEntry>(
            r"SELECT * FROM command_log
              WHERE kiosk_id = ?
              ORDER BY id DESC
              LIMIT ?",
        )
        .bind(kiosk_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::EventDetails;

    async fn audit() -> (StaffAudit, EventLogger) {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        (StaffAudit::new(&db, events.clone()), events)
    }

    #[tokio::test]
    async fn staff_actions_are_evented() {
        let (audit, events) = audit().await;
        audit
            .record(StaffAction {
                user: "ayse".to_owned(),
                action: "bulk_open".to_owned(),
                resource_type: "kiosk".to_owned(),
                resource_id: "gym-main".to_owned(),
                details: serde_json::json!({"locker_ids": [1, 2, 3]}),
                ip: Some("10.0.0.5".to_owned()),
                user_agent: Some("panel/0.3".to_owned()),
                session_id: Some("sess-1".to_owned()),
            })
            .await
            .unwrap();

        let log = events.recent(1).await.unwrap();
        assert_eq!(log[0].event_type, EventType::StaffAudit);
        assert_eq!(log[0].staff_user.as_deref(), Some("ayse"));
        assert!(matches!(
            &log[0].details.0,
            EventDetails::Known(EventDetail::StaffAudit { action, ip, .. })
                if action == "bulk_open" && ip.as_deref() == Some("10.0.0.5")
        ));
    }

    #[tokio::test]
    async fn command_results_land_in_the_log() {
        let (audit, _) = audit().await;
        audit
            .log_command(CommandResult {
                command_id: "cmd-1".to_owned(),
                kiosk_id: "gym-main".to_owned(),
                locker_id: Some(7),
                kind: CommandKind::OpenLocker,
                issued_by: "ayse".to_owned(),
                success: true,
                message: Some("opened".to_owned()),
                error: None,
                execution_time_ms: Some(412),
            })
            .await
            .unwrap();

        let entries = audit.command_log("gym-main", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].locker_id, Some(7));
        assert!(entries[0].success);
    }
}
