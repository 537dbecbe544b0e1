//! FRP panel
//!
//! Management panel for a fleet of FRP-compatible reverse-tunnel nodes. Users
//! define tunnels against nodes; the panel enforces per-user quotas, tracks
//! node health and keeps every tunnel's registered proxy in line with what
//! its owner asked for.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod audit;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod middleware_auth;
pub mod models;
pub mod monitor;
pub mod node_client;
pub mod reconciler;
pub mod registry;
pub mod routes;

use auth::AuthService;
use config::Config;
use database::{Database, SeedReport};
use ledger::QuotaLedger;
use monitor::NodeMonitor;
use reconciler::Reconciler;

/// Shared application state containing all service instances
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub auth: Arc<AuthService>,
    pub ledger: Arc<QuotaLedger>,
    pub monitor: Arc<NodeMonitor>,
    pub reconciler: Arc<Reconciler>,
}

/// Standard API response wrapper for consistent JSON responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Creates the admin account, default group and default packages if missing
pub async fn seed_defaults(
    database: &Database,
    config: &Config,
    auth: &AuthService,
) -> anyhow::Result<SeedReport> {
    let admin = models::NewUser {
        username: config.seed.admin_username.clone(),
        email: config.seed.admin_email.clone(),
        password_hash: auth.hash_password(&config.seed.admin_password)?,
        is_admin: true,
        user_group_id: None,
    };
    database.seed_defaults(&admin).await
}
