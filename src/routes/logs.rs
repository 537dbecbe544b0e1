//! Operation log queries

use axum::{
    extract::{Query, State},
    response::Json,
    Extension,
};

use crate::{
    auth::AuthUser,
    error::AppResult,
    models::{OperationLog, OperationLogQuery},
    ApiResponse, AppState,
};

/// Admins see every entry, other users only their own
pub async fn list_logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<OperationLogQuery>,
) -> AppResult<Json<ApiResponse<Vec<OperationLog>>>> {
    let scope = if user.is_admin { None } else { Some(user.id) };
    let logs = state.database.list_operation_logs(scope, &query).await?;
    Ok(Json(ApiResponse::success(logs)))
}
