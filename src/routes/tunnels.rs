//! Tunnel definitions and lifecycle
//!
//! Start, stop, delete and batch requests go through the reconciler, which
//! serializes them per tunnel; configuration edits are only accepted while a
//! tunnel is stopped.

use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde::Serialize;
use serde_json::json;
use std::net::IpAddr;
use uuid::Uuid;

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{require_admin, AuthUser},
    error::{AppError, AppResult},
    models::{
        BatchOperation, BatchRequest, CreateTunnelRequest, DeleteTunnelQuery, NewTunnel, Tunnel,
        TunnelEdit, TunnelFilter, TunnelType, UpdateTunnelRequest,
    },
    reconciler::{BatchOutcome, PhaseSnapshot, TransitionOutcome},
    registry::Registry,
    routes::parse_id,
    ApiResponse, AppState,
};

const MAX_BATCH: usize = 100;

/// Tunnel row plus its live reconciler phase
#[derive(Debug, Serialize)]
pub struct TunnelView {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub proxy_name: String,
    pub phase: PhaseSnapshot,
}

impl TunnelView {
    fn new(state: &AppState, tunnel: Tunnel) -> Self {
        Self {
            proxy_name: tunnel.proxy_name(),
            phase: state.reconciler.phase(&tunnel),
            tunnel,
        }
    }
}

/// Tunnel configuration after defaults, checked as a whole
struct TunnelConfig<'a> {
    name: &'a str,
    tunnel_type: TunnelType,
    local_ip: &'a str,
    local_port: i32,
    remote_port: Option<i32>,
    custom_domains: &'a [String],
    subdomain: Option<&'a str>,
}

fn valid_port(port: i32) -> bool {
    (1..=65535).contains(&port)
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn validate_config(config: &TunnelConfig<'_>) -> AppResult<()> {
    let name = config.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(AppError::Validation("Tunnel name must be 1-100 characters".to_string()));
    }
    if config.local_ip.parse::<IpAddr>().is_err() {
        return Err(AppError::Validation(format!("Invalid local IP '{}'", config.local_ip)));
    }
    if !valid_port(config.local_port) {
        return Err(AppError::Validation("Local port must be between 1 and 65535".to_string()));
    }

    if config.tunnel_type.uses_remote_port() {
        match config.remote_port {
            Some(port) if valid_port(port) => {}
            Some(_) => {
                return Err(AppError::Validation("Remote port must be between 1 and 65535".to_string()))
            }
            None => {
                return Err(AppError::Validation(format!(
                    "{} tunnels require a remote port",
                    config.tunnel_type.as_str()
                )))
            }
        }
    } else {
        let subdomain = config.subdomain.map(str::trim).filter(|s| !s.is_empty());
        if subdomain.is_none() && config.custom_domains.is_empty() {
            return Err(AppError::Validation(format!(
                "{} tunnels require a subdomain or a custom domain",
                config.tunnel_type.as_str()
            )));
        }
        if let Some(subdomain) = subdomain {
            if subdomain.contains('.') || !valid_domain(subdomain) {
                return Err(AppError::Validation(format!("Invalid subdomain '{}'", subdomain)));
            }
        }
        if let Some(bad) = config.custom_domains.iter().find(|d| !valid_domain(d)) {
            return Err(AppError::Validation(format!("Invalid custom domain '{}'", bad)));
        }
    }
    Ok(())
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}

/// Merges an update into the stored tunnel. Fields the resulting type does not
/// use are cleared, so a type change never leaves a stale port or domain behind.
fn merge_update(current: &Tunnel, payload: &UpdateTunnelRequest) -> TunnelEdit {
    let tunnel_type = payload.tunnel_type.unwrap_or(current.tunnel_type);
    let (remote_port, custom_domains, subdomain) = if tunnel_type.uses_remote_port() {
        (payload.remote_port.or(current.remote_port), Vec::new(), None)
    } else {
        let subdomain = match &payload.subdomain {
            Some(subdomain) => non_empty(subdomain),
            None => current.subdomain.clone(),
        };
        let custom_domains = payload
            .custom_domains
            .clone()
            .unwrap_or_else(|| current.custom_domains.clone());
        (None, custom_domains, subdomain)
    };

    TunnelEdit {
        name: payload.name.as_deref().unwrap_or(&current.name).trim().to_string(),
        tunnel_type,
        local_ip: payload.local_ip.as_deref().unwrap_or(&current.local_ip).trim().to_string(),
        local_port: payload.local_port.unwrap_or(current.local_port),
        remote_port,
        custom_domains,
        subdomain,
        description: match &payload.description {
            Some(description) => non_empty(description),
            None => current.description.clone(),
        },
    }
}

/// Loads a tunnel the caller may see. Other users' tunnels look missing.
async fn load_visible_tunnel(state: &AppState, user: &AuthUser, tunnel_id: Uuid) -> AppResult<Tunnel> {
    state
        .database
        .get_tunnel(tunnel_id)
        .await?
        .filter(|t| user.is_admin || t.user_id == user.id)
        .ok_or_else(|| AppError::NotFound(format!("Tunnel {} not found", tunnel_id)))
}

async fn ensure_unique(
    state: &AppState,
    user_id: Uuid,
    node_id: Uuid,
    name: &str,
    tunnel_type: TunnelType,
    remote_port: Option<i32>,
    excluding: Option<Uuid>,
) -> AppResult<()> {
    if state.database.tunnel_name_taken(user_id, name, excluding).await? {
        return Err(AppError::Conflict(format!("Tunnel name '{}' already exists", name)));
    }
    if let (true, Some(port)) = (tunnel_type.uses_remote_port(), remote_port) {
        if state.database.remote_port_taken(node_id, port, excluding).await? {
            return Err(AppError::Conflict(format!(
                "Remote port {} is already in use on this node",
                port
            )));
        }
    }
    Ok(())
}

pub async fn list_tunnels(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(filter): Query<TunnelFilter>,
) -> AppResult<Json<ApiResponse<Vec<TunnelView>>>> {
    let owner = if user.is_admin { None } else { Some(user.id) };
    let tunnels = state.database.list_tunnels(owner, &filter).await?;
    let views = tunnels.into_iter().map(|t| TunnelView::new(&state, t)).collect();
    Ok(Json(ApiResponse::success(views)))
}

pub async fn get_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<TunnelView>>> {
    let tunnel = load_visible_tunnel(&state, &user, parse_id(&id, "tunnel")?).await?;
    Ok(Json(ApiResponse::success(TunnelView::new(&state, tunnel))))
}

pub async fn create_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(payload): Json<CreateTunnelRequest>,
) -> AppResult<Json<ApiResponse<TunnelView>>> {
    let name = payload.name.trim().to_string();
    let local_ip = payload.local_ip.as_deref().map(str::trim).unwrap_or("127.0.0.1").to_string();
    let (remote_port, custom_domains, subdomain) = if payload.tunnel_type.uses_remote_port() {
        (payload.remote_port, Vec::new(), None)
    } else {
        (None, payload.custom_domains, payload.subdomain.as_deref().and_then(non_empty))
    };

    validate_config(&TunnelConfig {
        name: &name,
        tunnel_type: payload.tunnel_type,
        local_ip: &local_ip,
        local_port: payload.local_port,
        remote_port,
        custom_domains: &custom_domains,
        subdomain: subdomain.as_deref(),
    })?;

    if state.database.get_node(payload.node_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Node {} not found", payload.node_id)));
    }
    ensure_unique(&state, user.id, payload.node_id, &name, payload.tunnel_type, remote_port, None).await?;

    let tunnel = state
        .database
        .create_tunnel(&NewTunnel {
            name,
            tunnel_type: payload.tunnel_type,
            local_ip,
            local_port: payload.local_port,
            remote_port,
            custom_domains,
            subdomain,
            description: payload.description,
            node_id: payload.node_id,
            user_id: user.id,
        })
        .await?;

    AuditEntry::new("create", "tunnel")
        .actor(user.id)
        .resource(tunnel.id, tunnel.name.clone())
        .details_json(&json!({
            "type": tunnel.tunnel_type,
            "node_id": tunnel.node_id,
            "remote_port": tunnel.remote_port,
        }))
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(TunnelView::new(&state, tunnel))))
}

pub async fn update_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(payload): Json<UpdateTunnelRequest>,
) -> AppResult<Json<ApiResponse<TunnelView>>> {
    let tunnel_id = parse_id(&id, "tunnel")?;
    load_visible_tunnel(&state, &user, tunnel_id).await?;

    let edit_state = state.clone();
    let result = state
        .reconciler
        .edit_stopped(tunnel_id, move |current| async move {
            let edit = merge_update(&current, &payload);
            validate_config(&TunnelConfig {
                name: &edit.name,
                tunnel_type: edit.tunnel_type,
                local_ip: &edit.local_ip,
                local_port: edit.local_port,
                remote_port: edit.remote_port,
                custom_domains: &edit.custom_domains,
                subdomain: edit.subdomain.as_deref(),
            })?;
            ensure_unique(
                &edit_state,
                current.user_id,
                current.node_id,
                &edit.name,
                edit.tunnel_type,
                edit.remote_port,
                Some(current.id),
            )
            .await?;

            edit_state
                .database
                .update_tunnel(current.id, &edit)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Tunnel {} not found", current.id)))
        })
        .await;

    AuditEntry::new("update", "tunnel")
        .actor(user.id)
        .resource_id(tunnel_id)
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(TunnelView::new(&state, result?))))
}

pub async fn delete_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Query(query): Query<DeleteTunnelQuery>,
) -> AppResult<Json<ApiResponse<()>>> {
    if query.force {
        require_admin(&user)?;
    }
    let tunnel = load_visible_tunnel(&state, &user, parse_id(&id, "tunnel")?).await?;
    let result = if query.force {
        state.reconciler.force_delete(tunnel.id).await
    } else {
        state.reconciler.delete(tunnel.id).await
    };

    AuditEntry::new(if query.force { "force_delete" } else { "delete" }, "tunnel")
        .actor(user.id)
        .resource(tunnel.id, tunnel.name.clone())
        .details_json(&json!({ "node_id": tunnel.node_id, "status": tunnel.status }))
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    result?;
    Ok(Json(ApiResponse::success(())))
}

async fn transition(
    state: AppState,
    user: AuthUser,
    meta: RequestMeta,
    id: String,
    operation: BatchOperation,
) -> AppResult<Json<ApiResponse<TransitionOutcome>>> {
    let tunnel = load_visible_tunnel(&state, &user, parse_id(&id, "tunnel")?).await?;
    let (action, result) = match operation {
        BatchOperation::Start => ("start", state.reconciler.request_start(tunnel.id).await),
        _ => ("stop", state.reconciler.request_stop(tunnel.id).await),
    };

    let mut entry = AuditEntry::new(action, "tunnel")
        .actor(user.id)
        .resource(tunnel.id, tunnel.name.clone())
        .request(&meta)
        .outcome(&result);
    if let Ok(outcome) = &result {
        entry = entry.details_json(&json!({ "phase": outcome.phase, "changed": outcome.changed }));
    }
    entry.record(&state.database).await;

    Ok(Json(ApiResponse::success(result?)))
}

pub async fn start_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<TransitionOutcome>>> {
    transition(state, user, meta, id, BatchOperation::Start).await
}

pub async fn stop_tunnel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<TransitionOutcome>>> {
    transition(state, user, meta, id, BatchOperation::Stop).await
}

/// Applies one operation to many tunnels; each item succeeds or fails on its own
pub async fn batch_operation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(payload): Json<BatchRequest>,
) -> AppResult<Json<ApiResponse<BatchOutcome>>> {
    if payload.tunnel_ids.is_empty() {
        return Err(AppError::Validation("No tunnels given".to_string()));
    }
    if payload.tunnel_ids.len() > MAX_BATCH {
        return Err(AppError::Validation(format!(
            "At most {} tunnels per batch",
            MAX_BATCH
        )));
    }

    let owner = if user.is_admin { None } else { Some(user.id) };
    let outcome = state
        .reconciler
        .batch(payload.tunnel_ids, payload.operation, owner)
        .await;

    let failures: Vec<_> = outcome
        .results
        .iter()
        .filter(|r| !r.success)
        .map(|r| json!({ "tunnel_id": r.tunnel_id, "code": r.error_code }))
        .collect();
    let mut entry = AuditEntry::new(
        match payload.operation {
            BatchOperation::Start => "batch_start",
            BatchOperation::Stop => "batch_stop",
            BatchOperation::Delete => "batch_delete",
        },
        "tunnel",
    )
    .actor(user.id)
    .details_json(&json!({
        "success_count": outcome.success_count,
        "failure_count": outcome.failure_count,
        "failures": failures,
    }))
    .request(&meta);
    if outcome.success_count == 0 {
        entry = entry.failed(&AppError::Conflict("No tunnel in the batch succeeded".to_string()));
    }
    entry.record(&state.database).await;

    Ok(Json(ApiResponse::success(outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DesiredState, TunnelStatus};
    use chrono::Utc;

    fn stored(tunnel_type: TunnelType) -> Tunnel {
        let now = Utc::now();
        let port_based = tunnel_type.uses_remote_port();
        Tunnel {
            id: Uuid::new_v4(),
            name: "site".to_string(),
            tunnel_type,
            local_ip: "127.0.0.1".to_string(),
            local_port: 8080,
            remote_port: port_based.then_some(6000),
            custom_domains: if port_based { Vec::new() } else { vec!["app.example.com".to_string()] },
            subdomain: (!port_based).then(|| "blog".to_string()),
            description: Some("staging".to_string()),
            status: TunnelStatus::Stopped,
            desired_status: DesiredState::Stopped,
            last_error: None,
            bytes_in: 0,
            bytes_out: 0,
            node_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_type_change_drops_remote_port() {
        let current = stored(TunnelType::Tcp);
        let edit = merge_update(
            &current,
            &UpdateTunnelRequest {
                tunnel_type: Some(TunnelType::Http),
                subdomain: Some(" shop ".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(edit.tunnel_type, TunnelType::Http);
        assert_eq!(edit.remote_port, None);
        assert_eq!(edit.subdomain.as_deref(), Some("shop"));
        assert_eq!(edit.local_port, 8080);
        assert_eq!(edit.description.as_deref(), Some("staging"));
    }

    #[test]
    fn test_type_change_drops_host_names() {
        let current = stored(TunnelType::Https);
        let edit = merge_update(
            &current,
            &UpdateTunnelRequest {
                tunnel_type: Some(TunnelType::Udp),
                remote_port: Some(5353),
                ..Default::default()
            },
        );
        assert_eq!(edit.remote_port, Some(5353));
        assert!(edit.custom_domains.is_empty());
        assert_eq!(edit.subdomain, None);
    }

    #[test]
    fn test_empty_values_clear_optional_fields() {
        let current = stored(TunnelType::Http);
        let edit = merge_update(
            &current,
            &UpdateTunnelRequest {
                subdomain: Some(String::new()),
                description: Some("  ".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(edit.subdomain, None);
        assert_eq!(edit.description, None);
        assert_eq!(edit.custom_domains, current.custom_domains);

        // without a custom domain the cleared subdomain leaves nothing to route on
        let edit = merge_update(
            &current,
            &UpdateTunnelRequest {
                subdomain: Some(String::new()),
                custom_domains: Some(Vec::new()),
                ..Default::default()
            },
        );
        let config = TunnelConfig {
            name: &edit.name,
            tunnel_type: edit.tunnel_type,
            local_ip: &edit.local_ip,
            local_port: edit.local_port,
            remote_port: edit.remote_port,
            custom_domains: &edit.custom_domains,
            subdomain: edit.subdomain.as_deref(),
        };
        assert!(matches!(validate_config(&config), Err(AppError::Validation(_))));
    }

    fn tcp(remote_port: Option<i32>) -> TunnelConfig<'static> {
        TunnelConfig {
            name: "ssh",
            tunnel_type: TunnelType::Tcp,
            local_ip: "127.0.0.1",
            local_port: 22,
            remote_port,
            custom_domains: &[],
            subdomain: None,
        }
    }

    #[test]
    fn test_port_tunnels_need_valid_remote_port() {
        assert!(validate_config(&tcp(Some(6022))).is_ok());
        assert!(validate_config(&tcp(None)).is_err());
        assert!(validate_config(&tcp(Some(0))).is_err());
        assert!(validate_config(&tcp(Some(65536))).is_err());

        let bad_local = TunnelConfig { local_port: 70000, ..tcp(Some(6022)) };
        assert!(validate_config(&bad_local).is_err());
        let bad_ip = TunnelConfig { local_ip: "localhost:22", ..tcp(Some(6022)) };
        assert!(validate_config(&bad_ip).is_err());
    }

    #[test]
    fn test_http_tunnels_need_a_host_name() {
        let domains = vec!["app.example.com".to_string()];
        let with_domain = TunnelConfig {
            tunnel_type: TunnelType::Http,
            remote_port: None,
            custom_domains: &domains,
            ..tcp(None)
        };
        assert!(validate_config(&with_domain).is_ok());

        let with_subdomain = TunnelConfig {
            tunnel_type: TunnelType::Https,
            subdomain: Some("blog"),
            ..tcp(None)
        };
        assert!(validate_config(&with_subdomain).is_ok());

        let bare = TunnelConfig { tunnel_type: TunnelType::Http, ..tcp(None) };
        assert!(matches!(validate_config(&bare), Err(AppError::Validation(_))));

        let dotted = TunnelConfig {
            tunnel_type: TunnelType::Http,
            subdomain: Some("a.b"),
            ..tcp(None)
        };
        assert!(validate_config(&dotted).is_err());

        let bad_domains = vec!["-bad-.example.com".to_string()];
        let bad = TunnelConfig {
            tunnel_type: TunnelType::Http,
            custom_domains: &bad_domains,
            ..tcp(None)
        };
        assert!(validate_config(&bad).is_err());
    }
}
