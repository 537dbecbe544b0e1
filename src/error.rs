//! Error handling for the panel
//!
//! One error type for every operation. Each variant is a distinct failure kind
//! with its own HTTP status and machine-readable code, so callers can tell a
//! quota denial from an unreachable node without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use tracing::error;

#[derive(Debug)]
pub enum AppError {
    /// Persistence failures
    Database(anyhow::Error),
    /// Missing or invalid credentials
    Auth(String),
    /// Authenticated but not allowed (non-admin on admin action, inactive account)
    PermissionDenied(String),
    /// Malformed input
    Validation(String),
    /// Missing user/node/tunnel/group/package
    NotFound(String),
    /// Duplicate name, or active usage blocking a change
    Conflict(String),
    /// Ledger denial
    QuotaExceeded(String),
    /// Control command or poll timed out or could not connect, after retries
    TransientNetwork(String),
    /// Node answered a control command with a rejection
    NodeRejected(String),
    /// Broken accounting invariant such as counter overflow
    InvariantViolation(String),
    Config(String),
    Internal(String),
}

impl AppError {
    /// Machine-readable kind carried in every error body
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::PermissionDenied(_) => "PERMISSION_DENIED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::TransientNetwork(_) => "TRANSIENT_NETWORK_FAILURE",
            AppError::NodeRejected(_) => "NODE_REJECTED",
            AppError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            AppError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NodeRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "Internal server error".to_string(),
            AppError::Auth(msg)
            | AppError::PermissionDenied(msg)
            | AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::QuotaExceeded(msg)
            | AppError::TransientNetwork(msg)
            | AppError::NodeRejected(msg)
            | AppError::InvariantViolation(msg)
            | AppError::Config(msg)
            | AppError::Internal(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "Database error: {:#}", err),
            AppError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            AppError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            AppError::TransientNetwork(msg) => write!(f, "Network failure: {}", msg),
            AppError::NodeRejected(msg) => write!(f, "Node rejected command: {}", msg),
            AppError::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(_)
            | AppError::InvariantViolation(_)
            | AppError::Config(_)
            | AppError::Internal(_) => error!("{}", self),
            _ => {}
        }

        let body = Json(json!({
            "success": false,
            "data": null,
            "error": {
                "code": self.code(),
                "message": self.public_message()
            },
            "timestamp": chrono::Utc::now()
        }));

        (self.status(), body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<crate::registry::CounterOverflow>().is_some() {
            return AppError::InvariantViolation(format!("{:#}", err));
        }
        AppError::Database(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            AppError::TransientNetwork(format!("HTTP request error: {}", err))
        } else {
            AppError::Internal(format!("HTTP request error: {}", err))
        }
    }
}

impl From<crate::auth::AuthError> for AppError {
    fn from(err: crate::auth::AuthError) -> Self {
        use crate::auth::AuthError;
        match err {
            AuthError::UserInactive | AuthError::InsufficientPermissions => {
                AppError::PermissionDenied(err.to_string())
            }
            AuthError::DatabaseError | AuthError::HashingError => AppError::Internal(err.to_string()),
            _ => AppError::Auth(err.to_string()),
        }
    }
}

impl From<crate::node_client::ControlError> for AppError {
    fn from(err: crate::node_client::ControlError) -> Self {
        if err.is_transient() {
            AppError::TransientNetwork(err.to_string())
        } else {
            AppError::NodeRejected(err.to_string())
        }
    }
}

#[macro_export]
macro_rules! auth_error {
    ($msg:expr) => {
        $crate::error::AppError::Auth($msg.to_string())
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::error::AppError::Validation($msg.to_string())
    };
}

#[macro_export]
macro_rules! not_found_error {
    ($msg:expr) => {
        $crate::error::AppError::NotFound($msg.to_string())
    };
}

#[macro_export]
macro_rules! conflict_error {
    ($msg:expr) => {
        $crate::error::AppError::Conflict($msg.to_string())
    };
}

#[macro_export]
macro_rules! forbidden_error {
    ($msg:expr) => {
        $crate::error::AppError::PermissionDenied($msg.to_string())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_kind_has_distinct_code() {
        let errors = vec![
            AppError::Database(anyhow::anyhow!("boom")),
            AppError::Auth("a".into()),
            AppError::PermissionDenied("b".into()),
            AppError::Validation("c".into()),
            AppError::NotFound("d".into()),
            AppError::Conflict("e".into()),
            AppError::QuotaExceeded("f".into()),
            AppError::TransientNetwork("g".into()),
            AppError::NodeRejected("h".into()),
            AppError::InvariantViolation("i".into()),
            AppError::Config("j".into()),
            AppError::Internal("k".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::QuotaExceeded("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::TransientNetwork("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(not_found_error!("tunnel").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_database_errors_are_not_leaked() {
        let err = AppError::Database(anyhow::anyhow!("password authentication failed for user"));
        assert_eq!(err.public_message(), "Internal server error");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_counter_overflow_is_invariant_violation() {
        use crate::registry::CounterOverflow;
        let err: AppError = anyhow::Error::new(CounterOverflow)
            .context("Failed to update user traffic total")
            .into();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert_eq!(err.code(), "INVARIANT_VIOLATION");

        let other: AppError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(other, AppError::Database(_)));
    }

    #[test]
    fn test_control_error_conversion() {
        use crate::node_client::ControlError;
        let transient: AppError = ControlError::Timeout.into();
        assert!(matches!(transient, AppError::TransientNetwork(_)));
        let rejected: AppError = ControlError::Rejected { status: 500, body: "x".into() }.into();
        assert!(matches!(rejected, AppError::NodeRejected(_)));
    }
}
