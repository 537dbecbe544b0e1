//! Background worker for the FRP panel
//!
//! Applies migrations, seeds default data and then runs periodic
//! maintenance: expiring package purchases and pruning raw traffic samples.

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use frp_panel::{
    audit::AuditEntry, auth::AuthService, config::Config, database::Database, seed_defaults,
};

async fn run_maintenance(database: &Database, config: &Config) -> Result<()> {
    let expiry = database.expire_packages(Utc::now()).await?;
    for user_id in &expiry.reverted_users {
        AuditEntry::new("group_reassign", "user")
            .resource_id(*user_id)
            .details("package expired, moved back to the default group")
            .record(database)
            .await;
    }

    let pruned = database
        .prune_traffic_logs(config.maintenance.traffic_log_retention_days)
        .await?;

    info!(
        expired_packages = expiry.expired,
        reverted_users = expiry.reverted_users.len(),
        pruned_traffic_logs = pruned,
        "maintenance pass completed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("FRP panel worker starting...");

    let database = Database::new(&config.database_url, config.database_max_connections).await?;
    database.migrate().await?;

    let auth = AuthService::new(&config.auth)?;
    seed_defaults(&database, &config, &auth).await?;

    let mut ticker = tokio::time::interval(config.maintenance.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping worker.");
                break;
            }

            _ = ticker.tick() => {
                if let Err(e) = run_maintenance(&database, &config).await {
                    error!(error = %e, "maintenance pass failed");
                }
            }
        }
    }

    Ok(())
}
