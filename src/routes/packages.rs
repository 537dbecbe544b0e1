//! Packages and purchases

use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use rust_decimal::Decimal;
use serde_json::json;

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{require_admin, AuthUser},
    database::DeleteOutcome,
    error::{AppError, AppResult},
    models::{
        CreatePackageRequest, GroupChangePreview, GroupLimits, Package, PurchaseOutcome,
        PurchaseRequest, UpdatePackageRequest, UserPackageView,
    },
    registry::Registry,
    routes::parse_id,
    ApiResponse, AppState,
};

fn validate_package(
    name: Option<&str>,
    price: Option<Decimal>,
    duration_days: Option<i32>,
    max_tunnels: Option<i32>,
    max_traffic: Option<i64>,
) -> AppResult<()> {
    if let Some(name) = name {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(AppError::Validation("Package name must be 1-100 characters".to_string()));
        }
    }
    if price.map_or(false, |p| p.is_sign_negative()) {
        return Err(AppError::Validation("Price cannot be negative".to_string()));
    }
    if duration_days.map_or(false, |d| d <= 0) {
        return Err(AppError::Validation("Duration must be at least one day".to_string()));
    }
    if max_tunnels.map_or(false, |v| v < 0) || max_traffic.map_or(false, |v| v < 0) {
        return Err(AppError::Validation("Quota limits cannot be negative".to_string()));
    }
    Ok(())
}

/// Inactive packages are only visible to admins
async fn load_package(state: &AppState, user: &AuthUser, package_id: uuid::Uuid) -> AppResult<Package> {
    state
        .database
        .get_package_by_id(package_id)
        .await?
        .filter(|p| p.is_active || user.is_admin)
        .ok_or_else(|| AppError::NotFound(format!("Package {} not found", package_id)))
}

pub async fn list_packages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<Vec<Package>>>> {
    let packages = state.database.list_packages(user.is_admin).await?;
    Ok(Json(ApiResponse::success(packages)))
}

pub async fn get_package(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Package>>> {
    let package = load_package(&state, &user, parse_id(&id, "package")?).await?;
    Ok(Json(ApiResponse::success(package)))
}

pub async fn create_package(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(mut payload): Json<CreatePackageRequest>,
) -> AppResult<Json<ApiResponse<Package>>> {
    require_admin(&user)?;
    payload.name = payload.name.trim().to_string();
    validate_package(
        Some(&payload.name),
        Some(payload.price),
        Some(payload.duration_days),
        Some(payload.max_tunnels),
        Some(payload.max_traffic),
    )?;
    if state.database.package_name_taken(&payload.name, None).await? {
        return Err(AppError::Conflict(format!("Package name '{}' already exists", payload.name)));
    }

    let package = state.database.create_package(&payload).await?;

    AuditEntry::new("create", "package")
        .actor(user.id)
        .resource(package.id, package.name.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(package)))
}

pub async fn update_package(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(mut payload): Json<UpdatePackageRequest>,
) -> AppResult<Json<ApiResponse<Package>>> {
    require_admin(&user)?;
    let package_id = parse_id(&id, "package")?;
    payload.name = payload.name.map(|name| name.trim().to_string());
    validate_package(
        payload.name.as_deref(),
        payload.price,
        payload.duration_days,
        payload.max_tunnels,
        payload.max_traffic,
    )?;
    if let Some(name) = &payload.name {
        if state.database.package_name_taken(name, Some(package_id)).await? {
            return Err(AppError::Conflict(format!("Package name '{}' already exists", name)));
        }
    }

    let package = state
        .database
        .update_package(package_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Package {} not found", package_id)))?;

    AuditEntry::new("update", "package")
        .actor(user.id)
        .resource(package.id, package.name.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(package)))
}

pub async fn delete_package(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    require_admin(&user)?;
    let package_id = parse_id(&id, "package")?;

    let result = match state.database.delete_package(package_id).await? {
        DeleteOutcome::Deleted => Ok(()),
        DeleteOutcome::NotFound => Err(AppError::NotFound(format!("Package {} not found", package_id))),
        DeleteOutcome::InUse(reason) => Err(AppError::Conflict(reason)),
    };

    AuditEntry::new("delete", "package")
        .actor(user.id)
        .resource_id(package_id)
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    result?;
    Ok(Json(ApiResponse::success(())))
}

pub async fn my_packages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<Vec<UserPackageView>>>> {
    let purchases = state.database.list_user_packages(user.id).await?;
    Ok(Json(ApiResponse::success(purchases)))
}

/// Buys a package for the caller. Without `confirm` only the preview of the
/// limits the purchase would replace is returned.
pub async fn purchase_package(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Path(id): Path<String>,
    payload: Option<Json<PurchaseRequest>>,
) -> AppResult<Json<ApiResponse<PurchaseOutcome>>> {
    let package_id = parse_id(&id, "package")?;
    let package = load_package(&state, &user, package_id).await?;
    if !package.is_active {
        return Err(AppError::Validation(format!("Package '{}' is not on sale", package.name)));
    }
    let confirm = payload.map_or(false, |Json(request)| request.confirm);

    let current = state.ledger.limits_for_user(user.id).await?;
    let proposed = GroupLimits::from(&package);

    if !confirm {
        let running = state.database.count_running_tunnels(user.id, None).await?;
        let preview = GroupChangePreview::new(user.id, current, proposed, running);
        return Ok(Json(ApiResponse::success(PurchaseOutcome::ConfirmationRequired { preview })));
    }

    let result = state
        .database
        .purchase_package(user.id, &package)
        .await
        .map_err(AppError::from);

    AuditEntry::new("purchase", "package")
        .actor(user.id)
        .resource(package.id, package.name.clone())
        .details_json(&json!({ "price": package.price, "duration_days": package.duration_days }))
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    let (user_package, group) = result?;

    AuditEntry::new("group_reassign", "user")
        .actor(user.id)
        .resource(user.id, user.username.clone())
        .details_json(&json!({
            "previous": current,
            "current": GroupLimits::from(&group),
            "package_id": package.id,
        }))
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(PurchaseOutcome::Applied {
        user_package,
        group,
        previous: current,
    })))
}
