//! Kiosk agent entry point.
//!
//! Bootstraps the shared store and configuration, spawns the relay driver
//! actor and the gateway loops, then serves the local QR surface with
//! graceful shutdown. Without a configured serial port the driver runs on
//! the loopback backend, which makes a hardware-less kiosk usable for
//! development and installation dry-runs.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use kabin_core::audit::StaffAudit;
use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::qr::QrTokenSigner;
use kabin_core::ratelimit::RateLimiter;
use kabin_core::rfid::SessionManager;
use kabin_core::state::StateStore;
use kabin_store::Db;

use kabin_kiosk::bus::{BusPort, LoopbackPort};
use kabin_kiosk::config::KioskConfig;
use kabin_kiosk::driver::{DriverSettings, RelayDriver};
use kabin_kiosk::exec::CommandExecutor;
use kabin_kiosk::flows::RfidFlow;
use kabin_kiosk::http;
use kabin_kiosk::poller::{self, GatewayClient};
use kabin_kiosk::state::{AppState, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = KioskConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(kiosk_id = %config.kiosk_id, zone = ?config.kiosk_zone, "kiosk agent starting");

    if let Some(dir) = Path::new(&config.db_path).parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let db = Db::open(&config.db_path).await.context("opening database")?;
    let system_config = Arc::new(
        ConfigManager::load(&config.config_path)
            .await
            .context("loading configuration document")?,
    );

    let events = EventLogger::new(&db);
    let state = StateStore::new(&db, events.clone());
    let audit = StaffAudit::new(&db, events.clone());
    let sessions = Arc::new(SessionManager::new(events.clone()));

    let snapshot = system_config.snapshot().await;
    let capacity = i64::from(snapshot.total_capacity());
    if capacity > 0 {
        state
            .ensure_lockers(&config.kiosk_id, capacity, &snapshot)
            .await
            .context("creating locker rows")?;
    }

    let driver = spawn_driver(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Session deadline sweeper.
    {
        let sessions = Arc::clone(&sessions);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = interval.tick() => {}
                }
                if let Err(err) = sessions.sweep_expired(chrono::Utc::now()).await {
                    warn!(error = %err, "session sweep failed");
                }
            }
        });
    }

    // Gateway loops.
    let client = Arc::new(GatewayClient::new(&config).context("building gateway client")?);
    let executor = CommandExecutor::new(
        state.clone(),
        driver.clone(),
        Arc::clone(&system_config),
        audit,
        events.clone(),
        config.kiosk_id.clone(),
        config.buzzer,
    );
    tokio::spawn(poller::heartbeat_loop(
        Arc::clone(&client),
        driver.clone(),
        Arc::clone(&system_config),
        config.clone(),
        VERSION,
        shutdown_rx.clone(),
    ));
    tokio::spawn(poller::command_loop(
        Arc::clone(&client),
        executor,
        config.poll_interval,
        shutdown_rx.clone(),
    ));

    // Local HTTP surface: QR pages plus the RFID reader feed.
    let flow = RfidFlow::new(
        state.clone(),
        sessions,
        driver.clone(),
        Arc::clone(&system_config),
        events.clone(),
        config.kiosk_id.clone(),
        config.kiosk_zone.clone(),
    );
    let app_state = Arc::new(AppState {
        db,
        state,
        events,
        limiter: RateLimiter::new(),
        signer: QrTokenSigner::new(config.qr_hmac_secret.as_bytes()),
        driver,
        flow,
        config: system_config,
        kiosk_id: config.kiosk_id.clone(),
        kiosk_zone: config.kiosk_zone.clone(),
        master_pin: config.master_pin.clone(),
        started_at: Instant::now(),
    });
    let app = http::router(app_state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "kiosk QR surface listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("kiosk agent stopped");
    Ok(())
}

/// Open the configured serial port, or fall back to the loopback backend.
fn spawn_driver(config: &KioskConfig) -> anyhow::Result<RelayDriver> {
    let settings = DriverSettings {
        pulse_duration: config.pulse_duration,
        ..DriverSettings::default()
    };

    let port: Box<dyn BusPort> = match &config.serial_port {
        #[cfg(feature = "serial-port")]
        Some(path) => {
            let port = kabin_kiosk::bus::SerialBusPort::open(
                path,
                config.modbus_baud,
                Duration::from_secs(1),
            )
            .with_context(|| format!("opening serial port {path}"))?;
            info!(path = %path, baud = config.modbus_baud, "serial port opened");
            Box::new(port)
        }
        #[cfg(not(feature = "serial-port"))]
        Some(path) => {
            warn!(path = %path, "built without serial-port feature, using loopback");
            let (port, _) = LoopbackPort::new();
            Box::new(port)
        }
        None => {
            warn!("no serial port configured, using loopback");
            let (port, _) = LoopbackPort::new();
            Box::new(port)
        }
    };

    Ok(RelayDriver::spawn(port, settings))
}

/// Resolve on SIGINT/SIGTERM and flip the shutdown channel.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
