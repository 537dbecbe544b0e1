//! Node control plane client
//!
//! Registers and deregisters proxies on a node through its dashboard API.
//! Both commands are idempotent from the caller's point of view: registering a
//! proxy that already exists and removing one that is already gone succeed.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::models::{GroupLimits, Node, Tunnel, TunnelType};

/// Header carrying the node's shared token
pub const NODE_TOKEN_HEADER: &str = "X-Node-Token";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("node {0} has no dashboard port configured")]
    NotConfigured(String),

    #[error("control request timed out")]
    Timeout,

    #[error("could not reach node: {0}")]
    Connection(String),

    #[error("node rejected command with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ControlError {
    /// Timeouts and connection failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Timeout | ControlError::Connection(_))
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ControlError::Timeout
        } else {
            ControlError::Connection(err.to_string())
        }
    }
}

/// Proxy definition sent to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: TunnelType,
    pub local_ip: String,
    pub local_port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// frp bandwidth notation, e.g. "512KB"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<String>,
}

impl ProxyConfig {
    /// Builds the node-side definition of a tunnel, applying the owner's speed cap
    pub fn from_tunnel(tunnel: &Tunnel, limits: &GroupLimits) -> Self {
        Self {
            name: tunnel.proxy_name(),
            proxy_type: tunnel.tunnel_type,
            local_ip: tunnel.local_ip.clone(),
            local_port: tunnel.local_port,
            remote_port: if tunnel.tunnel_type.uses_remote_port() {
                tunnel.remote_port
            } else {
                None
            },
            custom_domains: tunnel.custom_domains.clone(),
            subdomain: tunnel.subdomain.clone(),
            bandwidth_limit: limits
                .upload_limit
                .filter(|kb| *kb > 0)
                .map(|kb| format!("{}KB", kb)),
        }
    }
}

/// Commands the reconciler issues to a node
#[async_trait]
pub trait NodeControl: Send + Sync {
    async fn register_proxy(&self, node: &Node, proxy: &ProxyConfig) -> Result<(), ControlError>;

    async fn deregister_proxy(&self, node: &Node, proxy_name: &str) -> Result<(), ControlError>;
}

/// `NodeControl` over the node's HTTP dashboard API
#[derive(Clone)]
pub struct HttpNodeControl {
    client: Client,
}

impl HttpNodeControl {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn authorize(&self, builder: RequestBuilder, node: &Node) -> RequestBuilder {
        let builder = match &node.dashboard_user {
            Some(user) => builder.basic_auth(user, node.dashboard_password.as_deref()),
            None => builder,
        };
        match &node.token {
            Some(token) => builder.header(NODE_TOKEN_HEADER, token),
            None => builder,
        }
    }

    fn base_url(node: &Node) -> Result<String, ControlError> {
        node.dashboard_url()
            .ok_or_else(|| ControlError::NotConfigured(node.name.clone()))
    }
}

/// Maps a response onto the command outcome; `already` is the status meaning
/// the node is already in the requested state
async fn interpret(response: reqwest::Response, already: StatusCode) -> Result<(), ControlError> {
    let status = response.status();
    if status.is_success() || status == already {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ControlError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl NodeControl for HttpNodeControl {
    async fn register_proxy(&self, node: &Node, proxy: &ProxyConfig) -> Result<(), ControlError> {
        let url = format!("{}/api/proxy", Self::base_url(node)?);
        debug!(node = %node.name, proxy = %proxy.name, "registering proxy");

        let response = self
            .authorize(self.client.post(&url), node)
            .json(proxy)
            .send()
            .await?;
        interpret(response, StatusCode::CONFLICT).await
    }

    async fn deregister_proxy(&self, node: &Node, proxy_name: &str) -> Result<(), ControlError> {
        let url = format!("{}/api/proxy/{}", Self::base_url(node)?, proxy_name);
        debug!(node = %node.name, proxy = %proxy_name, "deregistering proxy");

        let response = self.authorize(self.client.delete(&url), node).send().await?;
        interpret(response, StatusCode::NOT_FOUND).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DesiredState, NodeStatus, TunnelStatus};
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn node_at(host: &str, port: u16) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "edge-1".to_string(),
            host: host.to_string(),
            port: 7000,
            dashboard_port: Some(port as i32),
            dashboard_user: Some("admin".to_string()),
            dashboard_password: Some("secret".to_string()),
            token: Some("node-token".to_string()),
            status: NodeStatus::Online,
            region: None,
            description: None,
            owner_id: Uuid::new_v4(),
            last_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tunnel(tunnel_type: TunnelType) -> Tunnel {
        Tunnel {
            id: Uuid::new_v4(),
            name: "ssh".to_string(),
            tunnel_type,
            local_ip: "127.0.0.1".to_string(),
            local_port: 22,
            remote_port: Some(6022),
            custom_domains: vec!["app.example.com".to_string()],
            subdomain: None,
            description: None,
            status: TunnelStatus::Stopped,
            desired_status: DesiredState::Running,
            last_error: None,
            bytes_in: 0,
            bytes_out: 0,
            node_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn client() -> HttpNodeControl {
        HttpNodeControl::new(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_proxy_config_applies_speed_cap() {
        let mut limits = GroupLimits::unlimited();
        limits.upload_limit = Some(512);
        let config = ProxyConfig::from_tunnel(&tunnel(TunnelType::Tcp), &limits);
        assert_eq!(config.bandwidth_limit.as_deref(), Some("512KB"));
        assert_eq!(config.remote_port, Some(6022));

        let http = ProxyConfig::from_tunnel(&tunnel(TunnelType::Http), &GroupLimits::unlimited());
        assert_eq!(http.remote_port, None);
        assert_eq!(http.bandwidth_limit, None);
    }

    #[tokio::test]
    async fn test_register_sends_config_with_credentials() {
        let server = MockServer::start_async().await;
        let tunnel = tunnel(TunnelType::Tcp);
        let proxy = ProxyConfig::from_tunnel(&tunnel, &GroupLimits::unlimited());

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/proxy")
                    .header("authorization", "Basic YWRtaW46c2VjcmV0")
                    .header("x-node-token", "node-token")
                    .json_body_partial(json!({ "name": tunnel.proxy_name(), "type": "tcp" }).to_string());
                then.status(201);
            })
            .await;

        let node = node_at(&server.host(), server.port());
        client().register_proxy(&node, &proxy).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_existing_proxy_is_noop() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/proxy");
                then.status(409).body("proxy already exists");
            })
            .await;

        let node = node_at(&server.host(), server.port());
        let proxy = ProxyConfig::from_tunnel(&tunnel(TunnelType::Tcp), &GroupLimits::unlimited());
        assert!(client().register_proxy(&node, &proxy).await.is_ok());
    }

    #[tokio::test]
    async fn test_deregister_missing_proxy_is_noop() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/proxy/tunnel-abc");
                then.status(404);
            })
            .await;

        let node = node_at(&server.host(), server.port());
        client().deregister_proxy(&node, "tunnel-abc").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_rejection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/proxy/tunnel-abc");
                then.status(500).body("boom");
            })
            .await;

        let node = node_at(&server.host(), server.port());
        let err = client().deregister_proxy(&node, "tunnel-abc").await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected { status: 500, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        // Nothing listens on port 1
        let node = node_at("127.0.0.1", 1);
        let proxy = ProxyConfig::from_tunnel(&tunnel(TunnelType::Tcp), &GroupLimits::unlimited());
        let err = client().register_proxy(&node, &proxy).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_dashboard_port() {
        let mut node = node_at("127.0.0.1", 1);
        node.dashboard_port = None;
        let err = client().deregister_proxy(&node, "x").await.unwrap_err();
        assert!(matches!(err, ControlError::NotConfigured(_)));
    }
}
