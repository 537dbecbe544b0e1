//! HTTP routes
//!
//! Every handler answers with the [`ApiResponse`] envelope. Routes other than
//! registration, login and `/health` sit behind the bearer-token middleware.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    middleware_auth::auth_middleware,
    ApiResponse, AppState,
};

pub mod auth;
pub mod groups;
pub mod logs;
pub mod nodes;
pub mod packages;
pub mod traffic;
pub mod tunnels;
pub mod users;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login));

    let protected = Router::new()
        // Account
        .route("/api/auth/profile", get(auth::profile).put(auth::update_profile))
        .route("/api/auth/password", put(auth::change_password))
        // Users
        .route("/api/users", get(users::list_users))
        .route("/api/users/me/quota", get(users::my_quota))
        .route("/api/users/:id", get(users::get_user).put(users::update_user))
        .route("/api/users/:id/group", put(users::assign_group))
        // Groups
        .route("/api/user-groups", get(groups::list_groups).post(groups::create_group))
        .route(
            "/api/user-groups/:id",
            get(groups::get_group)
                .put(groups::update_group)
                .delete(groups::delete_group),
        )
        .route("/api/user-groups/:id/users", get(groups::list_group_users))
        // Packages
        .route("/api/packages", get(packages::list_packages).post(packages::create_package))
        .route(
            "/api/packages/:id",
            get(packages::get_package)
                .put(packages::update_package)
                .delete(packages::delete_package),
        )
        .route("/api/packages/:id/purchase", post(packages::purchase_package))
        .route("/api/user/packages", get(packages::my_packages))
        // Nodes
        .route("/api/nodes", get(nodes::list_nodes).post(nodes::create_node))
        .route(
            "/api/nodes/:id",
            get(nodes::get_node).put(nodes::update_node).delete(nodes::delete_node),
        )
        .route("/api/nodes/:id/status", get(nodes::node_status))
        // Tunnels
        .route("/api/tunnels", get(tunnels::list_tunnels).post(tunnels::create_tunnel))
        .route("/api/tunnels/batch", post(tunnels::batch_operation))
        .route(
            "/api/tunnels/:id",
            get(tunnels::get_tunnel)
                .put(tunnels::update_tunnel)
                .delete(tunnels::delete_tunnel),
        )
        .route("/api/tunnels/:id/start", post(tunnels::start_tunnel))
        .route("/api/tunnels/:id/stop", post(tunnels::stop_tunnel))
        // Traffic
        .route("/api/traffic/log", post(traffic::log_traffic))
        .route("/api/traffic/realtime", get(traffic::realtime))
        .route("/api/traffic/daily", get(traffic::daily))
        .route("/api/traffic/summary", get(traffic::summary))
        // Audit trail
        .route("/api/logs", get(logs::list_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(public).merge(protected).with_state(state)
}

pub(crate) fn parse_id(id: &str, what: &str) -> AppResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| AppError::Validation(format!("Invalid {} ID format", what)))
}

/// Admins may act on anyone; other users only on themselves
pub(crate) fn ensure_self_or_admin(user: &AuthUser, owner_id: Uuid) -> AppResult<()> {
    if user.is_admin || user.id == owner_id {
        Ok(())
    } else {
        Err(AppError::PermissionDenied("Not allowed to access another user's data".to_string()))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: DateTime<Utc>,
    services: ServiceStatus,
}

#[derive(Serialize)]
struct ServiceStatus {
    database: bool,
    monitor: LoopStatus,
    reconciler: LoopStatus,
}

#[derive(Serialize)]
struct LoopStatus {
    alive: bool,
    last_run: Option<DateTime<Utc>>,
}

/// A loop counts as alive once it has run within three of its intervals
fn loop_status(last_run: Option<DateTime<Utc>>, interval: std::time::Duration, now: DateTime<Utc>) -> LoopStatus {
    let allowance = chrono::Duration::from_std(interval * 3).unwrap_or_else(|_| chrono::Duration::minutes(5));
    LoopStatus {
        alive: last_run.map_or(false, |at| now - at <= allowance),
        last_run,
    }
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let now = Utc::now();
    let database = state.database.health_check().await.is_ok();
    let monitor = loop_status(state.monitor.last_sweep().await, state.monitor.interval(), now);
    let reconciler = loop_status(state.reconciler.last_pass().await, state.reconciler.interval(), now);

    let healthy = database && monitor.alive && reconciler.alive;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now,
        services: ServiceStatus {
            database,
            monitor,
            reconciler,
        },
    };

    let code = if database { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(ApiResponse::success(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_loop_status_window() {
        let now = Utc::now();
        let interval = Duration::from_secs(15);

        assert!(!loop_status(None, interval, now).alive);
        assert!(loop_status(Some(now - chrono::Duration::seconds(40)), interval, now).alive);
        assert!(!loop_status(Some(now - chrono::Duration::seconds(50)), interval, now).alive);
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "tunnel").unwrap(), id);
        assert!(matches!(parse_id("42", "tunnel"), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_self_or_admin() {
        let me = AuthUser { id: Uuid::new_v4(), username: "me".into(), is_admin: false };
        assert!(ensure_self_or_admin(&me, me.id).is_ok());
        assert!(matches!(
            ensure_self_or_admin(&me, Uuid::new_v4()),
            Err(AppError::PermissionDenied(_))
        ));
        let admin = AuthUser { is_admin: true, ..me.clone() };
        assert!(ensure_self_or_admin(&admin, Uuid::new_v4()).is_ok());
    }
}
