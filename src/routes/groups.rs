//! Quota groups

use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{require_admin, AuthUser},
    database::DeleteOutcome,
    error::{AppError, AppResult},
    models::{CreateGroupRequest, UpdateGroupRequest, User, UserGroup, UserGroupWithCount},
    routes::parse_id,
    ApiResponse, AppState,
};

fn validate_limits(
    name: Option<&str>,
    max_tunnels: Option<i32>,
    max_traffic: Option<i64>,
    upload_limit: Option<i32>,
    download_limit: Option<i32>,
) -> AppResult<()> {
    if let Some(name) = name {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(AppError::Validation("Group name must be 1-100 characters".to_string()));
        }
    }
    if max_tunnels.map_or(false, |v| v < 0) || max_traffic.map_or(false, |v| v < 0) {
        return Err(AppError::Validation("Quota limits cannot be negative".to_string()));
    }
    if upload_limit.map_or(false, |v| v < 0) || download_limit.map_or(false, |v| v < 0) {
        return Err(AppError::Validation("Bandwidth limits cannot be negative".to_string()));
    }
    Ok(())
}

async fn load_group(state: &AppState, group_id: uuid::Uuid) -> AppResult<UserGroup> {
    state
        .database
        .get_group_by_id(group_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User group {} not found", group_id)))
}

pub async fn list_groups(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<UserGroupWithCount>>>> {
    let groups = state.database.list_groups().await?;
    Ok(Json(ApiResponse::success(groups)))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<UserGroup>>> {
    let group = load_group(&state, parse_id(&id, "group")?).await?;
    Ok(Json(ApiResponse::success(group)))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(mut payload): Json<CreateGroupRequest>,
) -> AppResult<Json<ApiResponse<UserGroup>>> {
    require_admin(&user)?;
    payload.name = payload.name.trim().to_string();
    validate_limits(
        Some(&payload.name),
        payload.max_tunnels,
        payload.max_traffic,
        payload.upload_limit,
        payload.download_limit,
    )?;
    if state.database.group_name_taken(&payload.name, None).await? {
        return Err(AppError::Conflict(format!("Group name '{}' already exists", payload.name)));
    }

    let group = state.database.create_group(&payload).await?;

    AuditEntry::new("create", "user_group")
        .actor(user.id)
        .resource(group.id, group.name.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(group)))
}

pub async fn update_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(mut payload): Json<UpdateGroupRequest>,
) -> AppResult<Json<ApiResponse<UserGroup>>> {
    require_admin(&user)?;
    let group_id = parse_id(&id, "group")?;
    payload.name = payload.name.map(|name| name.trim().to_string());
    validate_limits(
        payload.name.as_deref(),
        payload.max_tunnels,
        payload.max_traffic,
        payload.upload_limit,
        payload.download_limit,
    )?;

    let existing = load_group(&state, group_id).await?;
    if existing.is_default && payload.is_default == Some(false) {
        return Err(AppError::Conflict(
            "Flag another group as default instead of clearing the default flag".to_string(),
        ));
    }
    if let Some(name) = &payload.name {
        if state.database.group_name_taken(name, Some(group_id)).await? {
            return Err(AppError::Conflict(format!("Group name '{}' already exists", name)));
        }
    }

    let group = state
        .database
        .update_group(group_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User group {} not found", group_id)))?;

    AuditEntry::new("update", "user_group")
        .actor(user.id)
        .resource(group.id, group.name.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(group)))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    require_admin(&user)?;
    let group_id = parse_id(&id, "group")?;

    let result = match state.database.delete_group(group_id).await? {
        DeleteOutcome::Deleted => Ok(()),
        DeleteOutcome::NotFound => Err(AppError::NotFound(format!("User group {} not found", group_id))),
        DeleteOutcome::InUse(reason) => Err(AppError::Conflict(reason)),
    };

    AuditEntry::new("delete", "user_group")
        .actor(user.id)
        .resource_id(group_id)
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    result?;
    Ok(Json(ApiResponse::success(())))
}

pub async fn list_group_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<User>>>> {
    require_admin(&user)?;
    let group = load_group(&state, parse_id(&id, "group")?).await?;
    let users = state.database.list_group_users(group.id).await?;
    Ok(Json(ApiResponse::success(users)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_limit_validation() {
        assert!(validate_limits(Some("basic"), Some(3), Some(1024), None, Some(512)).is_ok());
        assert!(validate_limits(None, None, None, None, None).is_ok());
        assert!(validate_limits(Some("   "), None, None, None, None).is_err());
        assert!(validate_limits(Some("basic"), Some(-1), None, None, None).is_err());
        assert!(validate_limits(Some("basic"), None, None, Some(-5), None).is_err());
    }
}
