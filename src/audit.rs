//! Operation audit trail
//!
//! Handlers describe what they did with an [`AuditEntry`] and hand it to
//! [`AuditEntry::record`]. Writing the row never fails the request: a
//! storage error is logged and dropped.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use tracing::warn;
use uuid::Uuid;

use crate::{
    database::Database,
    error::{AppError, AppResult},
    models::{NewOperationLog, OperationStatus},
};

/// Client address and agent of the request being audited
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        // first hop of X-Forwarded-For is the original client
        let ip_address = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|value| value.split(',').next())
            .or_else(|| headers.get("x-real-ip").and_then(|h| h.to_str().ok()))
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|ua| ua.chars().take(512).collect());

        Self { ip_address, user_agent }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// Builder for one operation log row
#[derive(Debug, Clone)]
pub struct AuditEntry {
    log: NewOperationLog,
}

impl AuditEntry {
    pub fn new(action: &str, resource_type: &str) -> Self {
        Self {
            log: NewOperationLog {
                user_id: None,
                action: action.to_string(),
                resource_type: resource_type.to_string(),
                resource_id: None,
                resource_name: None,
                details: None,
                ip_address: None,
                user_agent: None,
                status: OperationStatus::Success,
                error_message: None,
            },
        }
    }

    pub fn actor(mut self, user_id: Uuid) -> Self {
        self.log.user_id = Some(user_id);
        self
    }

    pub fn resource(mut self, resource_id: Uuid, name: impl Into<String>) -> Self {
        self.log.resource_id = Some(resource_id);
        self.log.resource_name = Some(name.into());
        self
    }

    pub fn resource_id(mut self, resource_id: Uuid) -> Self {
        self.log.resource_id = Some(resource_id);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.log.details = Some(details.into());
        self
    }

    pub fn details_json(self, details: &serde_json::Value) -> Self {
        self.details(details.to_string())
    }

    pub fn request(mut self, meta: &RequestMeta) -> Self {
        self.log.ip_address = meta.ip_address.clone();
        self.log.user_agent = meta.user_agent.clone();
        self
    }

    pub fn failed(mut self, error: &AppError) -> Self {
        self.log.status = OperationStatus::Failed;
        self.log.error_message = Some(error.public_message());
        self
    }

    /// Marks the entry failed when `result` is an error
    pub fn outcome<T>(self, result: &AppResult<T>) -> Self {
        match result {
            Ok(_) => self,
            Err(e) => self.failed(e),
        }
    }

    pub fn into_log(self) -> NewOperationLog {
        self.log
    }

    pub async fn record(self, database: &Database) {
        let log = self.into_log();
        if let Err(e) = database.insert_operation_log(&log).await {
            warn!(
                action = %log.action,
                resource_type = %log.resource_type,
                error = %e,
                "failed to write operation log"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());

        let meta = RequestMeta::from_headers(&headers);
        assert_eq!(meta.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("curl/8.0"));

        headers.remove("x-forwarded-for");
        assert_eq!(RequestMeta::from_headers(&headers).ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(RequestMeta::from_headers(&HeaderMap::new()), RequestMeta::default());
    }

    #[test]
    fn test_failed_outcome_keeps_public_message() {
        let actor = Uuid::new_v4();
        let tunnel = Uuid::new_v4();
        let result: AppResult<()> = Err(AppError::QuotaExceeded("tunnel limit of 3 reached".into()));

        let log = AuditEntry::new("start", "tunnel")
            .actor(actor)
            .resource(tunnel, "ssh")
            .outcome(&result)
            .into_log();

        assert_eq!(log.user_id, Some(actor));
        assert_eq!(log.resource_id, Some(tunnel));
        assert_eq!(log.status, OperationStatus::Failed);
        assert_eq!(log.error_message.as_deref(), Some("tunnel limit of 3 reached"));

        let ok: AppResult<()> = Ok(());
        let log = AuditEntry::new("stop", "tunnel").outcome(&ok).into_log();
        assert_eq!(log.status, OperationStatus::Success);
        assert!(log.error_message.is_none());
    }
}
