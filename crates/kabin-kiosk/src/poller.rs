//! Gateway client and background loops.
//!
//! The kiosk pushes a heartbeat every 10 seconds — the first one after boot
//! carries the restart marker, which makes the gateway clear this kiosk's
//! command queue — and long-polls for commands on a shorter cadence. Every
//! outward request has an explicit deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use kabin_core::config::ConfigManager;
use kabin_core::types::{CommandKind, CommandPayload};

use crate::config::KioskConfig;
use crate::driver::RelayDriver;
use crate::exec::CommandExecutor;

/// Deadline for every HTTP call to the gateway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from talking to the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned status {status}")]
    Status { status: u16 },
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    kiosk_id: &'a str,
    version: &'a str,
    config_hash: &'a str,
    degraded: bool,
    restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_reason: Option<&'a str>,
}

/// Gateway's answer to a heartbeat.
#[derive(Debug, Deserialize)]
pub struct HeartbeatAck {
    /// Gateway's current configuration hash; a mismatch means this kiosk
    /// should reload its configuration document.
    pub config_hash: String,
    pub commands_pending: i64,
}

/// One command as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct PolledCommand {
    pub command_id: Uuid,
    pub kind: CommandKind,
    pub payload: CommandPayload,
}

#[derive(Debug, Serialize)]
struct FailRequest<'a> {
    error: &'a str,
}

/// Authenticated HTTP client for the kiosk→gateway surface.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    kiosk_id: String,
    hardware_id: String,
    secret: String,
    http: reqwest::Client,
}

impl GatewayClient {
    /// Build a client from the kiosk configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Http`] if the underlying client cannot be
    /// constructed.
    pub fn new(config: &KioskConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: config.gateway_url.trim_end_matches('/').to_owned(),
            kiosk_id: config.kiosk_id.clone(),
            hardware_id: config.hardware_id.clone(),
            secret: config.kiosk_secret.clone(),
            http,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("X-Kiosk-Id", &self.kiosk_id)
            .header("X-Kiosk-Secret", &self.secret)
            .header("X-Hardware-Id", &self.hardware_id)
    }

    /// POST `/heartbeat`.
    pub async fn heartbeat(
        &self,
        version: &str,
        config_hash: &str,
        degraded: bool,
        restarted: bool,
        restart_reason: Option<&str>,
    ) -> Result<HeartbeatAck, GatewayError> {
        let response = self
            .authed(self.http.post(format!("{}/heartbeat", self.base_url)))
            .json(&HeartbeatRequest {
                kiosk_id: &self.kiosk_id,
                version,
                config_hash,
                degraded,
                restarted,
                restart_reason,
            })
            .send()
            .await?;
        Self::expect_ok(&response)?;
        Ok(response.json().await?)
    }

    /// GET `/commands?kiosk_id=…`, leasing pending commands.
    pub async fn fetch_commands(&self) -> Result<Vec<PolledCommand>, GatewayError> {
        let response = self
            .authed(self.http.get(format!(
                "{}/commands?kiosk_id={}",
                self.base_url, self.kiosk_id
            )))
            .send()
            .await?;
        Self::expect_ok(&response)?;
        Ok(response.json().await?)
    }

    /// POST `/commands/{id}/complete`.
    pub async fn complete(&self, command_id: Uuid) -> Result<(), GatewayError> {
        let response = self
            .authed(self.http.post(format!(
                "{}/commands/{command_id}/complete",
                self.base_url
            )))
            .send()
            .await?;
        Self::expect_ok(&response)
    }

    /// POST `/commands/{id}/fail`.
    pub async fn fail(&self, command_id: Uuid, error: &str) -> Result<(), GatewayError> {
        let response = self
            .authed(
                self.http
                    .post(format!("{}/commands/{command_id}/fail", self.base_url)),
            )
            .json(&FailRequest { error })
            .send()
            .await?;
        Self::expect_ok(&response)
    }

    fn expect_ok(response: &reqwest::Response) -> Result<(), GatewayError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::Status {
                status: status.as_u16(),
            })
        }
    }
}

/// Heartbeat loop. The first beat carries the restart marker.
pub async fn heartbeat_loop(
    client: Arc<GatewayClient>,
    driver: RelayDriver,
    config: Arc<ConfigManager>,
    kiosk_config: KioskConfig,
    version: &'static str,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(kiosk_config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut restarted = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let health = driver.health().await;
        let config_hash = config.hash().await;
        let reason = restarted.then_some(kiosk_config.restart_reason.as_str());

        match client
            .heartbeat(version, &config_hash, health.degraded, restarted, reason)
            .await
        {
            Ok(ack) => {
                restarted = false;
                if ack.config_hash != config_hash {
                    warn!(
                        ours = %config_hash,
                        gateway = %ack.config_hash,
                        "configuration drift detected"
                    );
                }
                debug!(pending = ack.commands_pending, "heartbeat acknowledged");
            }
            Err(err) => warn!(error = %err, "heartbeat failed"),
        }
    }
}

/// Command poll-execute-acknowledge loop.
pub async fn command_loop(
    client: Arc<GatewayClient>,
    executor: CommandExecutor,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let commands = match client.fetch_commands().await {
            Ok(commands) => commands,
            Err(err) => {
                warn!(error = %err, "command poll failed");
                continue;
            }
        };

        for command in commands {
            let ack = match executor.execute(&command).await {
                Ok(_) => client.complete(command.command_id).await,
                Err(err) => client.fail(command.command_id, &err.to_string()).await,
            };
            if let Err(err) = ack {
                warn!(command_id = %command.command_id, error = %err,
                      "failed to acknowledge command; lease sweeper will recover it");
            }
        }
    }
}
