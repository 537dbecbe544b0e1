//! FRP panel server
//!
//! Serves the HTTP API and runs the node health monitor and tunnel
//! reconciler loops in the same process, so every tunnel operation, whether
//! it comes from a request or from reconciliation, goes through one
//! per-tunnel lock.

use anyhow::Result;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use frp_panel::{
    auth::AuthService,
    config::Config,
    database::Database,
    ledger::QuotaLedger,
    monitor::NodeMonitor,
    node_client::HttpNodeControl,
    reconciler::Reconciler,
    registry::Registry,
    routes, AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load()?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting FRP panel server");

    let database = Arc::new(Database::new(&config.database_url, config.database_max_connections).await?);
    database.migrate().await?;

    let auth = Arc::new(AuthService::new(&config.auth)?);
    frp_panel::seed_defaults(&database, &config, &auth).await?;
    let registry: Arc<dyn Registry> = database.clone();

    let ledger = Arc::new(QuotaLedger::new(registry.clone()));
    let monitor = Arc::new(NodeMonitor::new(registry.clone(), &config.monitor)?);
    let control = Arc::new(HttpNodeControl::new(config.reconciler.control_timeout())?);
    let reconciler = Arc::new(Reconciler::new(
        registry,
        ledger.clone(),
        monitor.clone(),
        control,
        config.reconciler.clone(),
    ));
    info!("All services initialized successfully");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor.clone().run(shutdown_rx.clone()));
    let reconciler_task = tokio::spawn(reconciler.clone().run(shutdown_rx));

    let state = AppState {
        config: config.clone(),
        database,
        auth,
        ledger,
        monitor,
        reconciler,
    };

    let app = routes::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = TcpListener::bind(&config.server_address).await?;
    info!("Server listening on {}", config.server_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, waiting for background loops");
    let _ = shutdown_tx.send(true);
    for (name, task) in [("monitor", monitor_task), ("reconciler", reconciler_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
