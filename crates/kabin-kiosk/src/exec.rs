//! Execution of gateway commands against local hardware and state.
//!
//! Staff-issued opens never mutate ownership: an owned locker passes
//! through Opening and returns to Owned; a free locker is just pulsed.
//! Every execution lands in the command log with its timing and outcome.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use kabin_core::audit::{CommandResult, StaffAudit};
use kabin_core::config::ConfigManager;
use kabin_core::error::{EventError, HardwareError, StateError, ZoneError};
use kabin_core::events::EventLogger;
use kabin_core::state::{Actor, StateStore};
use kabin_core::types::{CommandPayload, EventDetail, EventType, LockerStatus, NewEvent};
use kabin_core::zone::{self, CoilAddress};

use crate::driver::RelayDriver;
use crate::poller::PolledCommand;

/// Errors from executing one command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Zone(#[from] ZoneError),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Executes polled commands. One per kiosk process.
#[derive(Clone)]
pub struct CommandExecutor {
    state: StateStore,
    driver: RelayDriver,
    config: Arc<ConfigManager>,
    audit: StaffAudit,
    events: EventLogger,
    kiosk_id: String,
    buzzer: Option<CoilAddress>,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(
        state: StateStore,
        driver: RelayDriver,
        config: Arc<ConfigManager>,
        audit: StaffAudit,
        events: EventLogger,
        kiosk_id: String,
        buzzer: Option<CoilAddress>,
    ) -> Self {
        Self {
            state,
            driver,
            config,
            audit,
            events,
            kiosk_id,
            buzzer,
        }
    }

    /// Execute one command, recording the outcome in the command log.
    pub async fn execute(&self, command: &PolledCommand) -> Result<String, ExecError> {
        let started = Instant::now();
        let result = self.run(command).await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let log = CommandResult {
            command_id: command.command_id.to_string(),
            kiosk_id: self.kiosk_id.clone(),
            locker_id: command.payload.locker_id(),
            kind: command.payload.kind(),
            issued_by: "gateway".to_owned(),
            success: result.is_ok(),
            message: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(ToString::to_string),
            execution_time_ms: Some(elapsed_ms),
        };
        self.audit.log_command(log).await?;

        match &result {
            Ok(message) => info!(command_id = %command.command_id, message, "command executed"),
            Err(err) => warn!(command_id = %command.command_id, error = %err, "command failed"),
        }
        result
    }

    async fn run(&self, command: &PolledCommand) -> Result<String, ExecError> {
        match &command.payload {
            CommandPayload::OpenLocker { locker_id, .. } => {
                self.open_locker(*locker_id).await?;
                Ok(format!("locker {locker_id} opened"))
            }
            CommandPayload::CloseLocker { locker_id } => {
                let coil = self.resolve(*locker_id).await?;
                self.driver.force_off(coil).await?;
                Ok(format!("locker {locker_id} coil off"))
            }
            CommandPayload::BulkOpen {
                locker_ids,
                exclude_vip,
            } => self.bulk_open(locker_ids, *exclude_vip).await,
            CommandPayload::BlockLocker { locker_id, .. } => {
                // State was already blocked panel-side; make sure the coil
                // is not latched.
                let coil = self.resolve(*locker_id).await?;
                self.driver.force_off(coil).await?;
                Ok(format!("locker {locker_id} secured"))
            }
            CommandPayload::UnblockLocker { locker_id } => {
                Ok(format!("locker {locker_id} back in service"))
            }
            CommandPayload::ResetLocker { locker_id } => {
                self.reset_locker(*locker_id).await?;
                Ok(format!("locker {locker_id} reset"))
            }
            CommandPayload::Buzzer { .. } => match self.buzzer {
                Some(coil) => {
                    self.driver.pulse(coil).await?;
                    Ok("buzzer fired".to_owned())
                }
                None => Ok("buzzer not configured".to_owned()),
            },
        }
    }

    /// Open a locker without touching ownership. Owned lockers transit
    /// through Opening so a stuck pulse is visible to the timeout sweeper.
    async fn open_locker(&self, locker_id: i64) -> Result<(), ExecError> {
        let coil = self.resolve(locker_id).await?;
        let locker = self.state.get(&self.kiosk_id, locker_id).await?;

        if locker.status == LockerStatus::Owned {
            self.state
                .mark_opening(&self.kiosk_id, locker_id, Actor::system())
                .await?;
            let pulsed = self.driver.pulse(coil).await;
            self.state
                .finish_opening(&self.kiosk_id, locker_id, Actor::system())
                .await?;
            if let Err(err) = pulsed {
                self.hardware_event(&err, locker_id).await?;
                return Err(err.into());
            }
        } else if let Err(err) = self.driver.pulse(coil).await {
            self.hardware_event(&err, locker_id).await?;
            return Err(err.into());
        }
        Ok(())
    }

    async fn bulk_open(
        &self,
        locker_ids: &[i64],
        exclude_vip: bool,
    ) -> Result<String, ExecError> {
        let mut opened = 0u64;
        let mut excluded = 0u64;
        let mut failed = 0u64;

        for &locker_id in locker_ids {
            if exclude_vip {
                let locker = self.state.get(&self.kiosk_id, locker_id).await?;
                if locker.is_vip {
                    excluded += 1;
                    continue;
                }
            }
            match self.open_locker(locker_id).await {
                Ok(()) => opened += 1,
                Err(_) => failed += 1,
            }
        }

        self.events
            .append(
                NewEvent::new(EventType::BulkOpen)
                    .kiosk(&self.kiosk_id)
                    .details(EventDetail::BulkOpen {
                        requested: locker_ids.len() as u64,
                        enqueued: opened,
                        excluded_vip: excluded,
                    }),
            )
            .await?;

        Ok(format!(
            "opened {opened}/{}, excluded {excluded} VIP, {failed} failed",
            locker_ids.len()
        ))
    }

    /// Force-release whatever holds the locker and make sure the coil is
    /// off. VIP bindings are left alone.
    async fn reset_locker(&self, locker_id: i64) -> Result<(), ExecError> {
        match self
            .state
            .release(&self.kiosk_id, locker_id, None, Actor::system())
            .await
        {
            Ok(_) => {}
            Err(StateError::InvalidStatus { .. } | StateError::VipProtected) => {}
            Err(err) => return Err(err.into()),
        }
        let coil = self.resolve(locker_id).await?;
        self.driver.force_off(coil).await?;
        Ok(())
    }

    async fn resolve(&self, locker_id: i64) -> Result<CoilAddress, ExecError> {
        let snapshot = self.config.snapshot().await;
        Ok(zone::resolve(&snapshot, locker_id)?)
    }

    async fn hardware_event(&self, err: &HardwareError, locker_id: i64) -> Result<(), ExecError> {
        self.events
            .append(
                NewEvent::new(EventType::HardwareError)
                    .kiosk(&self.kiosk_id)
                    .locker(locker_id)
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
    use crate::bus::LoopbackPort;
    use crate::driver::DriverSettings;
    use kabin_core::config::SystemConfig;
    use kabin_core::types::OwnerType;
    use kabin_store::Db;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn executor() -> (CommandExecutor, StateStore, StaffAudit, crate::bus::LoopbackHandle, TempDir)
    {
        let db = Db::open_in_memory().await.unwrap();
        let events = EventLogger::new(&db);
        let state = StateStore::new(&db, events.clone());
        state
            .ensure_lockers("kiosk-1", 16, &SystemConfig::default())
            .await
            .unwrap();
        let audit = StaffAudit::new(&db, events.clone());

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

        let executor = CommandExecutor::new(
            state.clone(),
            driver,
            config,
            audit.clone(),
            events,
            "kiosk-1".to_owned(),
            None,
        );
        (executor, state, audit, handle, dir)
    }

    fn command(payload: CommandPayload) -> PolledCommand {
        PolledCommand {
            command_id: Uuid::new_v4(),
            kind: payload.kind(),
            payload,
        }
    }

    #[tokio::test]
    async fn open_leaves_ownership_untouched() {
        let (executor, state, _, handle, _dir) = executor().await;
        state
            .assign_direct("kiosk-1", 4, OwnerType::Rfid, "key4", Actor::staff("ops"))
            .await
            .unwrap();

        executor
            .execute(&command(CommandPayload::OpenLocker {
                locker_id: 4,
                reason: Some("member forgot code".to_owned()),
            }))
            .await
            .unwrap();

        let locker = state.get("kiosk-1", 4).await.unwrap();
        assert_eq!(locker.status, LockerStatus::Owned);
        assert_eq!(locker.owner_key.as_deref(), Some("key4"));
        assert_eq!(handle.sent().len(), 2);
    }

    #[tokio::test]
    async fn bulk_open_honors_vip_exclusion() {
        let (executor, state, _, handle, _dir) = executor().await;
        state
            .bind_vip("kiosk-1", 2, "0006851540", "c1", Actor::staff("ops"))
            .await
            .unwrap();

        let message = executor
            .execute(&command(CommandPayload::BulkOpen {
                locker_ids: vec![1, 2, 3],
                exclude_vip: true,
            }))
            .await
            .unwrap();
        assert!(message.contains("opened 2/3"));
        assert!(message.contains("excluded 1"));
        // Two pulses, two frames each.
        assert_eq!(handle.sent().len(), 4);
    }

    #[tokio::test]
    async fn reset_releases_and_clears_the_coil() {
        let (executor, state, _, handle, _dir) = executor().await;
        state
            .assign_direct("kiosk-1", 6, OwnerType::Device, "dev1", Actor::staff("ops"))
            .await
            .unwrap();

        executor
            .execute(&command(CommandPayload::ResetLocker { locker_id: 6 }))
            .await
            .unwrap();

        assert_eq!(
            state.get("kiosk-1", 6).await.unwrap().status,
            LockerStatus::Free
        );
        // Just the force-off frame.
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 0x00);
    }

    #[tokio::test]
    async fn executions_land_in_the_command_log() {
        let (executor, _, audit, _, _dir) = executor().await;
        executor
            .execute(&command(CommandPayload::Buzzer { pattern: None }))
            .await
            .unwrap();

        let entries = audit.command_log("kiosk-1", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].message.as_deref(), Some("buzzer not configured"));
    }
}
