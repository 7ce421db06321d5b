//! Gateway entry point.
//!
//! Bootstraps the shared store and configuration document, wires every
//! core manager into the shared [`AppState`], spawns the background
//! sweepers, and serves HTTP with graceful shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use kabin_core::audit::StaffAudit;
use kabin_core::commands::CommandQueue;
use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::heartbeat::HeartbeatManager;
use kabin_core::provisioning::Provisioner;
use kabin_core::state::StateStore;
use kabin_core::vip::VipContracts;
use kabin_store::Db;

use kabin_gateway::config::GatewayConfig;
use kabin_gateway::routes;
use kabin_gateway::state::AppState;
use kabin_gateway::workers::Sweepers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(addr = %config.bind_addr, "gateway starting");

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
    let queue = CommandQueue::new(&db, events.clone());
    let heartbeats = HeartbeatManager::new(&db, events.clone());
    let provisioner = Provisioner::new(
        &db,
        events.clone(),
        heartbeats.clone(),
        config.provisioning_secret.as_bytes(),
    );
    let vip = VipContracts::new(&db, state.clone());
    let audit = StaffAudit::new(&db, events.clone());

    // Make sure every known kiosk has its locker rows.
    let snapshot = system_config.snapshot().await;
    let capacity = i64::from(snapshot.total_capacity());
    if capacity > 0 {
        for kiosk in heartbeats.list().await.context("listing kiosks")? {
            state
                .ensure_lockers(&kiosk.kiosk_id, capacity, &snapshot)
                .await
                .context("creating locker rows")?;
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweepers = Sweepers {
        state: state.clone(),
        queue: queue.clone(),
        heartbeats: heartbeats.clone(),
        vip: vip.clone(),
        provisioner: provisioner.clone(),
    };
    let sweeper_handle = tokio::spawn(sweepers.run(
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_rx.clone(),
    ));

    let app_state = Arc::new(AppState {
        db,
        config: config.clone(),
        system_config,
        events,
        state,
        queue,
        heartbeats,
        provisioner,
        vip,
        audit,
        started_at: Instant::now(),
    });
    let app = routes::router(app_state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;

    info!("gateway stopped");
    Ok(())
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
