//! Traffic ingestion and reports

use axum::{
    extract::{Query, State},
    response::Json,
    Extension,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::AuthUser,
    error::{AppError, AppResult},
    ledger::TrafficRecord,
    models::{DailyTraffic, DailyTrafficQuery, TrafficLog, TrafficLogRequest, TrafficOverview},
    registry::Registry,
    ApiResponse, AppState,
};

const REALTIME_WINDOW_MINUTES: i64 = 10;
const DEFAULT_DAYS: i64 = 7;
const MAX_DAYS: i64 = 30;

#[derive(Debug, Serialize)]
pub struct TrafficLogResponse {
    #[serde(flatten)]
    pub record: TrafficRecord,
    /// Tunnels stopped because the sample pushed the owner over quota
    pub tunnels_stopped: usize,
}

#[derive(Debug, Serialize)]
pub struct RealtimeTraffic {
    pub window_minutes: i64,
    pub upload: i64,
    pub download: i64,
    pub samples: Vec<TrafficLog>,
}

/// Records a sample against one of the caller's tunnels and stops the
/// owner's tunnels when it crosses the traffic quota
pub async fn log_traffic(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(payload): Json<TrafficLogRequest>,
) -> AppResult<Json<ApiResponse<TrafficLogResponse>>> {
    let tunnel = state
        .database
        .get_tunnel(payload.tunnel_id)
        .await?
        .filter(|t| user.is_admin || t.user_id == user.id)
        .ok_or_else(|| AppError::NotFound(format!("Tunnel {} not found", payload.tunnel_id)))?;

    let record = state
        .ledger
        .record_traffic(tunnel.user_id, tunnel.id, payload.upload, payload.download)
        .await?;

    let mut tunnels_stopped = 0;
    if record.over_quota {
        warn!(
            user_id = %tunnel.user_id,
            total_traffic = record.totals.user_total,
            "traffic quota exceeded"
        );
        let result = state.reconciler.enforce_traffic_quota(tunnel.user_id).await;
        match &result {
            Ok(stopped) => tunnels_stopped = *stopped,
            Err(e) => error!(user_id = %tunnel.user_id, error = %e, "failed to enforce traffic quota"),
        }

        AuditEntry::new("quota_enforce", "user")
            .actor(user.id)
            .resource_id(tunnel.user_id)
            .details_json(&json!({
                "total_traffic": record.totals.user_total,
                "tunnels_stopped": tunnels_stopped,
            }))
            .request(&meta)
            .outcome(&result)
            .record(&state.database)
            .await;
    }

    Ok(Json(ApiResponse::success(TrafficLogResponse {
        record,
        tunnels_stopped,
    })))
}

pub async fn realtime(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<RealtimeTraffic>>> {
    let samples = state
        .database
        .get_recent_traffic(user.id, REALTIME_WINDOW_MINUTES)
        .await?;

    Ok(Json(ApiResponse::success(RealtimeTraffic {
        window_minutes: REALTIME_WINDOW_MINUTES,
        upload: samples.iter().map(|s| s.upload).sum(),
        download: samples.iter().map(|s| s.download).sum(),
        samples,
    })))
}

fn clamp_days(query: &DailyTrafficQuery) -> i64 {
    query.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS)
}

pub async fn daily(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<DailyTrafficQuery>,
) -> AppResult<Json<ApiResponse<Vec<DailyTraffic>>>> {
    let days = state.database.get_daily_traffic(user.id, clamp_days(&query)).await?;
    Ok(Json(ApiResponse::success(days)))
}

pub async fn summary(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<TrafficOverview>>> {
    let overview = state.database.get_traffic_overview(user.id).await?;
    Ok(Json(ApiResponse::success(overview)))
}
