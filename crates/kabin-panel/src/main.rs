//! Panel entry point.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use kabin_core::audit::StaffAudit;
use kabin_core::commands::CommandQueue;
use kabin_core::config::ConfigManager;
use kabin_core::events::EventLogger;
use kabin_core::heartbeat::HeartbeatManager;
use kabin_core::state::StateStore;
use kabin_core::vip::VipContracts;
use kabin_store::Db;

use kabin_panel::routes;
use kabin_panel::state::{AppState, PanelConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PanelConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(addr = %config.bind_addr, "panel starting");

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
    let vip = VipContracts::new(&db, state.clone());
    let audit = StaffAudit::new(&db, events.clone());

    let app_state = Arc::new(AppState {
        db,
        system_config,
        events,
        state,
        queue,
        heartbeats,
        vip,
        audit,
        started_at: Instant::now(),
    });
    let app = routes::router(app_state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "panel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("panel stopped");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM.
async fn shutdown_signal() {
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
}
