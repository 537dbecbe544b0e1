//! Proxy-server nodes

use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{require_admin, AuthUser},
    database::DeleteOutcome,
    error::{AppError, AppResult},
    models::{CreateNodeRequest, Node, UpdateNodeRequest},
    monitor::{NodeObservation, PollResult},
    registry::Registry,
    routes::parse_id,
    ApiResponse, AppState,
};

/// Node row plus what the monitor last saw of it
#[derive(Debug, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub observed: Option<NodeObservation>,
}

fn valid_port(port: i32) -> bool {
    (1..=65535).contains(&port)
}

fn validate_node(
    name: Option<&str>,
    host: Option<&str>,
    port: Option<i32>,
    dashboard_port: Option<i32>,
) -> AppResult<()> {
    if name.map_or(false, |n| n.trim().is_empty() || n.chars().count() > 100) {
        return Err(AppError::Validation("Node name must be 1-100 characters".to_string()));
    }
    if let Some(host) = host {
        let host = host.trim();
        if host.is_empty() || host.len() > 255 || host.contains(char::is_whitespace) || host.contains('/') {
            return Err(AppError::Validation("Invalid node host".to_string()));
        }
    }
    if port.map_or(false, |p| !valid_port(p)) || dashboard_port.map_or(false, |p| !valid_port(p)) {
        return Err(AppError::Validation("Ports must be between 1 and 65535".to_string()));
    }
    Ok(())
}

async fn load_node(state: &AppState, node_id: Uuid) -> AppResult<Node> {
    state
        .database
        .get_node(node_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Node {} not found", node_id)))
}

/// Served from the monitor cache, never polls
pub async fn list_nodes(State(state): State<AppState>) -> AppResult<Json<ApiResponse<Vec<NodeView>>>> {
    let nodes = state.database.list_nodes().await?;
    let mut observations = state.monitor.observations().await;

    let views = nodes
        .into_iter()
        .map(|node| NodeView {
            observed: observations.remove(&node.id),
            node,
        })
        .collect();
    Ok(Json(ApiResponse::success(views)))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<NodeView>>> {
    let node = load_node(&state, parse_id(&id, "node")?).await?;
    let observed = state.monitor.observation(node.id).await;
    Ok(Json(ApiResponse::success(NodeView { node, observed })))
}

/// Polls the node now and records the result
pub async fn node_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<PollResult>>> {
    let node = load_node(&state, parse_id(&id, "node")?).await?;
    let result = state.monitor.poll_and_record(&node).await;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn create_node(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(mut payload): Json<CreateNodeRequest>,
) -> AppResult<Json<ApiResponse<Node>>> {
    require_admin(&user)?;
    payload.name = payload.name.trim().to_string();
    payload.host = payload.host.trim().to_string();
    validate_node(Some(&payload.name), Some(&payload.host), payload.port, payload.dashboard_port)?;
    if state.database.node_name_taken(&payload.name, None).await? {
        return Err(AppError::Conflict(format!("Node name '{}' already exists", payload.name)));
    }

    let node = state.database.create_node(user.id, &payload).await?;

    AuditEntry::new("create", "node")
        .actor(user.id)
        .resource(node.id, node.name.clone())
        .details(format!("{}:{}", node.host, node.port))
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(node)))
}

pub async fn update_node(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(mut payload): Json<UpdateNodeRequest>,
) -> AppResult<Json<ApiResponse<Node>>> {
    require_admin(&user)?;
    let node_id = parse_id(&id, "node")?;
    payload.name = payload.name.map(|n| n.trim().to_string());
    payload.host = payload.host.map(|h| h.trim().to_string());
    validate_node(
        payload.name.as_deref(),
        payload.host.as_deref(),
        payload.port,
        payload.dashboard_port,
    )?;
    if let Some(name) = &payload.name {
        if state.database.node_name_taken(name, Some(node_id)).await? {
            return Err(AppError::Conflict(format!("Node name '{}' already exists", name)));
        }
    }

    let node = state
        .database
        .update_node(node_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Node {} not found", node_id)))?;

    AuditEntry::new("update", "node")
        .actor(user.id)
        .resource(node.id, node.name.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(node)))
}

pub async fn delete_node(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    require_admin(&user)?;
    let node_id = parse_id(&id, "node")?;

    let result = match state.database.delete_node(node_id).await? {
        DeleteOutcome::Deleted => {
            state.monitor.forget(node_id).await;
            Ok(())
        }
        DeleteOutcome::NotFound => Err(AppError::NotFound(format!("Node {} not found", node_id))),
        DeleteOutcome::InUse(reason) => Err(AppError::Conflict(reason)),
    };

    AuditEntry::new("delete", "node")
        .actor(user.id)
        .resource_id(node_id)
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    result?;
    Ok(Json(ApiResponse::success(())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_validation() {
        assert!(validate_node(Some("edge-1"), Some("frp.example.com"), Some(7000), Some(7500)).is_ok());
        assert!(validate_node(None, None, None, None).is_ok());
        assert!(validate_node(Some(" "), None, None, None).is_err());
        assert!(validate_node(None, Some("http://host/"), None, None).is_err());
        assert!(validate_node(None, None, Some(0), None).is_err());
        assert!(validate_node(None, None, None, Some(70000)).is_err());
    }
}
