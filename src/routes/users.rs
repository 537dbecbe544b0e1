//! User administration and quota views

use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde_json::json;

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{require_admin, AuthUser},
    error::{AppError, AppResult},
    ledger::QuotaUsage,
    models::{
        AssignGroupRequest, GroupChangeOutcome, GroupChangePreview, GroupLimits, Pagination,
        UpdateUserRequest, User,
    },
    registry::Registry,
    routes::{ensure_self_or_admin, parse_id},
    ApiResponse, AppState,
};

pub async fn list_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<User>>>> {
    require_admin(&user)?;
    let users = state.database.list_users(&pagination).await?;
    Ok(Json(ApiResponse::success(users)))
}

async fn load_user(state: &AppState, user_id: uuid::Uuid) -> AppResult<User> {
    state
        .database
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<User>>> {
    let user_id = parse_id(&id, "user")?;
    ensure_self_or_admin(&user, user_id)?;
    let account = load_user(&state, user_id).await?;
    Ok(Json(ApiResponse::success(account)))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(payload): Json<UpdateUserRequest>,
) -> AppResult<Json<ApiResponse<User>>> {
    require_admin(&user)?;
    let user_id = parse_id(&id, "user")?;

    if user_id == user.id && (payload.is_active == Some(false) || payload.is_admin == Some(false)) {
        return Err(AppError::Validation(
            "Administrators cannot deactivate or demote themselves".to_string(),
        ));
    }

    let account = state
        .database
        .update_user(user_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

    AuditEntry::new("update", "user")
        .actor(user.id)
        .resource(account.id, account.username.clone())
        .details_json(&json!({
            "is_active": payload.is_active,
            "is_admin": payload.is_admin,
        }))
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(account)))
}

/// Moves a user to another group. Without `confirm` only the preview of old
/// and new limits is returned.
pub async fn assign_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(payload): Json<AssignGroupRequest>,
) -> AppResult<Json<ApiResponse<GroupChangeOutcome>>> {
    require_admin(&user)?;
    let user_id = parse_id(&id, "user")?;
    let account = load_user(&state, user_id).await?;

    let proposed = match payload.user_group_id {
        Some(group_id) => {
            let group = state
                .database
                .get_group_by_id(group_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("User group {} not found", group_id)))?;
            GroupLimits::from(&group)
        }
        None => match state.database.get_default_group().await? {
            Some(group) => GroupLimits::from(&group),
            None => GroupLimits::unlimited(),
        },
    };
    let current = state.ledger.effective_limits(&account).await?;
    let running = state.database.count_running_tunnels(user_id, None).await?;

    if !payload.confirm {
        let preview = GroupChangePreview::new(user_id, current, proposed, running);
        return Ok(Json(ApiResponse::success(GroupChangeOutcome::ConfirmationRequired { preview })));
    }

    let updated = state
        .database
        .assign_user_group(user_id, payload.user_group_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

    AuditEntry::new("group_reassign", "user")
        .actor(user.id)
        .resource(updated.id, updated.username.clone())
        .details_json(&json!({ "previous": current, "current": proposed }))
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(GroupChangeOutcome::Applied {
        previous: current,
        current: proposed,
    })))
}

pub async fn my_quota(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<QuotaUsage>>> {
    let usage = state.ledger.usage(user.id).await?;
    Ok(Json(ApiResponse::success(usage)))
}
