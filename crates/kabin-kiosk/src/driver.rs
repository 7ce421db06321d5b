//! Hardware command serializer.
//!
//! The serial port is owned by a single actor task fed through an mpsc
//! channel — no call path touches the bus directly, so at most one request
//! is ever in flight and the inter-command gap is enforced in one place.
//! A pulse is ON, wait, OFF; the OFF write is always attempted even when
//! the ON write failed, so a coil is never left latched by a timeout.
//!
//! Transient failures (timeout, CRC, framing) retry with a bounded backoff;
//! repeated failures flip the driver into degraded mode, which clears on
//! the next successful exchange.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};

use kabin_core::error::{HardwareError, HardwareErrorKind};
use kabin_core::zone::CoilAddress;

use crate::bus::{BusError, BusPort};
use crate::modbus;

/// Tunables for the serializer. Defaults match the deployed relay cards.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// ON-to-OFF delay of a pulse.
    pub pulse_duration: Duration,
    /// Minimum quiet time between bus commands.
    pub inter_command_gap: Duration,
    /// Delay between pulses in burst mode.
    pub burst_interval: Duration,
    /// Upper bound on burst pulses.
    pub max_burst_pulses: u8,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    /// Delay before each retry.
    pub retry_backoff: Duration,
    /// Consecutive failures before the driver reports degraded.
    pub degraded_threshold: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            pulse_duration: Duration::from_millis(400),
            inter_command_gap: Duration::from_millis(300),
            burst_interval: Duration::from_secs(2),
            max_burst_pulses: 5,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            degraded_threshold: 5,
        }
    }
}

/// Rolling health counters exposed by the driver.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DriverHealth {
    pub total_commands: u64,
    pub failed_commands: u64,
    pub error_rate: f64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub degraded: bool,
}

enum Request {
    Pulse {
        coil: CoilAddress,
        respond: oneshot::Sender<Result<(), HardwareError>>,
    },
    Burst {
        coil: CoilAddress,
        pulses: u8,
        respond: oneshot::Sender<Result<(), HardwareError>>,
    },
    ForceOff {
        coil: CoilAddress,
        respond: oneshot::Sender<Result<(), HardwareError>>,
    },
    Health {
        respond: oneshot::Sender<DriverHealth>,
    },
}

/// Handle to the driver actor. Cheap to clone; dropping every handle stops
/// the actor.
#[derive(Debug, Clone)]
pub struct RelayDriver {
    tx: mpsc::Sender<Request>,
}

impl RelayDriver {
    /// Spawn the actor that owns `port`.
    #[must_use]
    pub fn spawn(port: Box<dyn BusPort>, settings: DriverSettings) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run(port, settings, rx));
        Self { tx }
    }

    /// One unlatch attempt: ON, wait, OFF.
    pub async fn pulse(&self, coil: CoilAddress) -> Result<(), HardwareError> {
        self.request(|respond| Request::Pulse { coil, respond }, coil)
            .await
    }

    /// Up to [`DriverSettings::max_burst_pulses`] pulses for a stuck relay.
    pub async fn burst(&self, coil: CoilAddress, pulses: u8) -> Result<(), HardwareError> {
        self.request(
            |respond| Request::Burst {
                coil,
                pulses,
                respond,
            },
            coil,
        )
        .await
    }

    /// Write the coil OFF unconditionally — the shutdown and block path.
    pub async fn force_off(&self, coil: CoilAddress) -> Result<(), HardwareError> {
        self.request(|respond| Request::ForceOff { coil, respond }, coil)
            .await
    }

    /// Current health counters.
    pub async fn health(&self) -> DriverHealth {
        let (respond, rx) = oneshot::channel();
        if self.tx.send(Request::Health { respond }).await.is_err() {
            return DriverHealth {
                degraded: true,
                ..DriverHealth::default()
            };
        }
        rx.await.unwrap_or_else(|_| DriverHealth {
            degraded: true,
            ..DriverHealth::default()
        })
    }

    async fn request<F>(&self, build: F, coil: CoilAddress) -> Result<(), HardwareError>
    where
        F: FnOnce(oneshot::Sender<Result<(), HardwareError>>) -> Request,
    {
        let gone = HardwareError {
            kind: HardwareErrorKind::PortUnavailable,
            slave_address: coil.slave_address,
            channel: coil.channel,
        };
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(build(respond))
            .await
            .map_err(|_| gone.clone())?;
        rx.await.map_err(|_| gone)?
    }
}

struct Stats {
    total: u64,
    failed: u64,
    consecutive_failures: u32,
    last_error_at: Option<DateTime<Utc>>,
    degraded_threshold: u32,
}

impl Stats {
    fn record(&mut self, result: &Result<(), HardwareError>) {
        self.total += 1;
        match result {
            Ok(()) => {
                if self.consecutive_failures >= self.degraded_threshold {
                    info!("bus recovered, leaving degraded mode");
                }
                self.consecutive_failures = 0;
            }
            Err(err) => {
                self.failed += 1;
                self.consecutive_failures += 1;
                self.last_error_at = Some(Utc::now());
                if self.consecutive_failures == self.degraded_threshold {
                    error!(error = %err, "bus entering degraded mode");
                }
            }
        }
    }

    fn health(&self) -> DriverHealth {
        DriverHealth {
            total_commands: self.total,
            failed_commands: self.failed,
            error_rate: if self.total == 0 {
                0.0
            } else {
                self.failed as f64 / self.total as f64
            },
            last_error_at: self.last_error_at,
            degraded: self.consecutive_failures >= self.degraded_threshold,
        }
    }
}

async fn run(mut port: Box<dyn BusPort>, settings: DriverSettings, mut rx: mpsc::Receiver<Request>) {
    let mut stats = Stats {
        total: 0,
        failed: 0,
        consecutive_failures: 0,
        last_error_at: None,
        degraded_threshold: settings.degraded_threshold,
    };
    let mut last_finished: Option<Instant> = None;

    while let Some(request) = rx.recv().await {
        let request = match request {
            Request::Health { respond } => {
                let _ = respond.send(stats.health());
                continue;
            }
            other => other,
        };

        // Enforce the inter-command quiet time on the bus.
        if let Some(finished) = last_finished {
            let elapsed = finished.elapsed();
            if elapsed < settings.inter_command_gap {
                tokio::time::sleep(settings.inter_command_gap - elapsed).await;
            }
        }

        match request {
            Request::Pulse { coil, respond } => {
                let result = pulse(port.as_mut(), &settings, coil).await;
                stats.record(&result);
                let _ = respond.send(result);
            }
            Request::Burst {
                coil,
                pulses,
                respond,
            } => {
                let pulses = pulses.clamp(1, settings.max_burst_pulses);
                let mut result = Ok(());
                for i in 0..pulses {
                    if i > 0 {
                        tokio::time::sleep(settings.burst_interval).await;
                    }
                    result = pulse(port.as_mut(), &settings, coil).await;
                    if result.is_err() {
                        break;
                    }
                }
                stats.record(&result);
                let _ = respond.send(result);
            }
            Request::ForceOff { coil, respond } => {
                let result = write_coil(port.as_mut(), &settings, coil, false).await;
                stats.record(&result);
                let _ = respond.send(result);
            }
            Request::Health { .. } => {}
        }

        last_finished = Some(Instant::now());
    }
}

/// ON, wait, OFF. The OFF write always runs so a failed or timed-out ON
/// cannot leave the coil latched.
async fn pulse(
    port: &mut dyn BusPort,
    settings: &DriverSettings,
    coil: CoilAddress,
) -> Result<(), HardwareError> {
    let on = write_coil(port, settings, coil, true).await;
    tokio::time::sleep(settings.pulse_duration).await;
    let off = write_coil(port, settings, coil, false).await;
    on.and(off)
}

async fn write_coil(
    port: &mut dyn BusPort,
    settings: &DriverSettings,
    coil: CoilAddress,
    on: bool,
) -> Result<(), HardwareError> {
    let frame = modbus::write_single_coil(coil.slave_address, coil.channel, on);
    let mut last_kind = HardwareErrorKind::Timeout;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            tokio::time::sleep(settings.retry_backoff).await;
        }

        let kind = match port.transact(&frame).await {
            Ok(response) => match modbus::check_echo(&frame, &response) {
                Ok(()) => return Ok(()),
                Err(err) => classify_frame_error(&err),
            },
            Err(err) => classify_bus_error(&err),
        };

        warn!(slave = coil.slave_address, channel = coil.channel, attempt,
              kind = ?kind, "coil write failed");
        last_kind = kind;
        if !kind.is_transient() {
            break;
        }
    }

    Err(HardwareError {
        kind: last_kind,
        slave_address: coil.slave_address,
        channel: coil.channel,
    })
}

fn classify_bus_error(err: &BusError) -> HardwareErrorKind {
    match err {
        BusError::Timeout => HardwareErrorKind::Timeout,
        BusError::Io(_) | BusError::Open { .. } => HardwareErrorKind::PortUnavailable,
    }
}

fn classify_frame_error(err: &modbus::FrameError) -> HardwareErrorKind {
    match err {
        modbus::FrameError::CrcMismatch { .. } => HardwareErrorKind::CrcMismatch,
        modbus::FrameError::Exception { .. } => HardwareErrorKind::BusException,
        modbus::FrameError::TooShort { .. } | modbus::FrameError::Mismatch => {
            HardwareErrorKind::Framing
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::{LoopbackHandle, LoopbackPort};

    fn fast_settings() -> DriverSettings {
        DriverSettings {
            pulse_duration: Duration::from_millis(1),
            inter_command_gap: Duration::from_millis(0),
            burst_interval: Duration::from_millis(1),
            retry_backoff: Duration::from_millis(1),
            ..DriverSettings::default()
        }
    }

    fn driver() -> (RelayDriver, LoopbackHandle) {
        let (port, handle) = LoopbackPort::new();
        (RelayDriver::spawn(Box::new(port), fast_settings()), handle)
    }

    fn coil() -> CoilAddress {
        CoilAddress {
            slave_address: 1,
            channel: 7,
        }
    }

    #[tokio::test]
    async fn pulse_writes_on_then_off() {
        let (driver, handle) = driver();
        driver.pulse(coil()).await.unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][4], 0xFF); // ON
        assert_eq!(sent[1][4], 0x00); // OFF
        assert_eq!(sent[0][0], 1);
        assert_eq!(u16::from(sent[0][3]) | (u16::from(sent[0][2]) << 8), 6);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (driver, handle) = driver();
        handle.inject_failure(BusError::Timeout);

        driver.pulse(coil()).await.unwrap();
        // First ON timed out, retry ON succeeded, then OFF.
        assert_eq!(handle.sent().len(), 3);

        let health = driver.health().await;
        assert_eq!(health.total_commands, 1);
        assert_eq!(health.failed_commands, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_and_off_is_still_attempted() {
        let (driver, handle) = driver();
        for _ in 0..3 {
            handle.inject_failure(BusError::Timeout);
        }

        let err = driver.pulse(coil()).await.unwrap_err();
        assert_eq!(err.kind, HardwareErrorKind::Timeout);
        assert_eq!(err.slave_address, 1);
        assert_eq!(err.channel, 7);

        // Three ON attempts, then the OFF write still went out.
        let sent = handle.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3][4], 0x00);

        let health = driver.health().await;
        assert_eq!(health.failed_commands, 1);
        assert!(health.error_rate > 0.99);
        assert!(health.last_error_at.is_some());
    }

    #[tokio::test]
    async fn burst_fires_multiple_pulses() {
        let (driver, handle) = driver();
        driver.burst(coil(), 3).await.unwrap();
        assert_eq!(handle.sent().len(), 6);
    }

    #[tokio::test]
    async fn burst_is_clamped_to_the_maximum() {
        let (driver, handle) = driver();
        driver.burst(coil(), 99).await.unwrap();
        assert_eq!(handle.sent().len() as u8, fast_settings().max_burst_pulses * 2);
    }

    #[tokio::test]
    async fn repeated_failures_enter_degraded_mode_and_recover() {
        let (driver, handle) = driver();
        // Each pulse burns 3 ON attempts + 3 OFF attempts when everything
        // times out; inject enough for five failed pulses.
        for _ in 0..30 {
            handle.inject_failure(BusError::Timeout);
        }
        for _ in 0..5 {
            let _ = driver.pulse(coil()).await;
        }
        assert!(driver.health().await.degraded);

        driver.pulse(coil()).await.unwrap();
        assert!(!driver.health().await.degraded);
    }

    #[tokio::test]
    async fn force_off_writes_a_single_off_frame() {
        let (driver, handle) = driver();
        driver.force_off(coil()).await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 0x00);
    }
}
