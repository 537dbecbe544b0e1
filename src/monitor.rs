//! Node health monitor
//!
//! Polls each node's dashboard API on a fixed schedule and caches what it saw:
//! reachability, consecutive failures and the names of proxies the node reports
//! online. Request handlers and the reconciler read the cache; only the
//! explicit status endpoint polls synchronously.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::MonitorConfig,
    models::{Node, NodeStatus, TunnelType},
    registry::Registry,
};

/// Summary a node reports about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[serde(default)]
    pub client_counts: Option<i64>,
    #[serde(default)]
    pub cur_conns: Option<i64>,
    #[serde(default)]
    pub total_traffic_in: Option<i64>,
    #[serde(default)]
    pub total_traffic_out: Option<i64>,
}

/// A proxy as listed by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub today_traffic_in: i64,
    #[serde(default)]
    pub today_traffic_out: i64,
    #[serde(default)]
    pub cur_conns: i64,
}

impl ProxyInfo {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Deserialize)]
struct ProxyList {
    #[serde(default)]
    proxies: Vec<ProxyInfo>,
}

/// Outcome of a single poll. Network failures are classified here, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub node_id: Uuid,
    pub status: NodeStatus,
    pub checked_at: DateTime<Utc>,
    pub server_info: Option<ServerInfo>,
    pub proxies: Option<Vec<ProxyInfo>>,
    pub error: Option<String>,
}

/// Cached view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeObservation {
    pub status: NodeStatus,
    pub checked_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    /// Proxies reported online; `None` when the list could not be read
    pub proxies: Option<HashSet<String>>,
}

enum FetchError {
    Unreachable(String),
    Invalid(String),
}

pub struct NodeMonitor {
    registry: Arc<dyn Registry>,
    client: Client,
    interval: Duration,
    failure_threshold: u32,
    cache: RwLock<HashMap<Uuid, NodeObservation>>,
    last_sweep: RwLock<Option<DateTime<Utc>>>,
}

impl NodeMonitor {
    pub fn new(registry: Arc<dyn Registry>, config: &MonitorConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()?;

        Ok(Self {
            registry,
            client,
            interval: config.interval(),
            failure_threshold: config.failure_threshold,
            cache: RwLock::new(HashMap::new()),
            last_sweep: RwLock::new(None),
        })
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    async fn fetch<T: DeserializeOwned>(&self, node: &Node, url: &str) -> Result<T, FetchError> {
        let mut request = self.client.get(url);
        if let Some(user) = &node.dashboard_user {
            request = request.basic_auth(user, node.dashboard_password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Invalid(format!("status endpoint returned {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Invalid(format!("malformed payload: {}", e)))
    }

    /// Polls one node: server info first, then the proxy list per tunnel type
    pub async fn poll(&self, node: &Node) -> PollResult {
        let checked_at = Utc::now();
        let classified = |status: NodeStatus, error: Option<String>| PollResult {
            node_id: node.id,
            status,
            checked_at,
            server_info: None,
            proxies: None,
            error,
        };

        let Some(base) = node.dashboard_url() else {
            return classified(NodeStatus::Unknown, None);
        };

        let server_info = match self
            .fetch::<ServerInfo>(node, &format!("{}/api/serverinfo", base))
            .await
        {
            Ok(info) => info,
            Err(FetchError::Unreachable(e)) => {
                debug!(node = %node.name, error = %e, "node unreachable");
                return classified(NodeStatus::Offline, Some(e));
            }
            Err(FetchError::Invalid(e)) => {
                debug!(node = %node.name, error = %e, "node answered with an invalid status");
                return classified(NodeStatus::Error, Some(e));
            }
        };

        let lists = join_all(TunnelType::ALL.iter().map(|kind| {
            let url = format!("{}/api/proxy/{}", base, kind.as_str());
            async move { self.fetch::<ProxyList>(node, &url).await }
        }))
        .await;

        let mut proxies = Vec::new();
        for list in lists {
            match list {
                Ok(list) => proxies.extend(list.proxies),
                Err(FetchError::Unreachable(e)) | Err(FetchError::Invalid(e)) => {
                    return PollResult {
                        server_info: Some(server_info),
                        ..classified(NodeStatus::Error, Some(format!("proxy list: {}", e)))
                    };
                }
            }
        }

        PollResult {
            node_id: node.id,
            status: NodeStatus::Online,
            checked_at,
            server_info: Some(server_info),
            proxies: Some(proxies),
            error: None,
        }
    }

    /// Polls a node, updates the cache and writes the result to the registry
    pub async fn poll_and_record(&self, node: &Node) -> PollResult {
        let result = self.poll(node).await;

        let observed = result.proxies.as_ref().map(|proxies| {
            proxies
                .iter()
                .filter(|p| p.is_online())
                .map(|p| p.name.clone())
                .collect::<HashSet<_>>()
        });

        let failures = {
            let mut cache = self.cache.write().await;
            let previous = cache.get(&node.id).map_or(0, |o| o.consecutive_failures);
            let consecutive_failures = if result.status.is_failure() {
                previous.saturating_add(1)
            } else {
                0
            };
            cache.insert(
                node.id,
                NodeObservation {
                    status: result.status,
                    checked_at: result.checked_at,
                    consecutive_failures,
                    proxies: observed,
                },
            );
            consecutive_failures
        };

        if failures == self.failure_threshold {
            warn!(
                node = %node.name,
                failures,
                status = ?result.status,
                "node failed consecutive health checks"
            );
        } else if result.status == NodeStatus::Online && node.status != NodeStatus::Online {
            info!(node = %node.name, "node is online");
        }

        if let Err(e) = self
            .registry
            .record_node_status(node.id, result.status, result.checked_at)
            .await
        {
            error!(node_id = %node.id, error = %e, "failed to record node status");
        }

        result
    }

    /// Polls every registered node concurrently; returns how many were polled
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let nodes = self.registry.list_nodes().await?;
        let results = join_all(nodes.iter().map(|node| self.poll_and_record(node))).await;

        let online = results.iter().filter(|r| r.status == NodeStatus::Online).count();
        debug!(polled = results.len(), online, "node sweep complete");

        *self.last_sweep.write().await = Some(Utc::now());
        Ok(results.len())
    }

    /// Periodic polling until `shutdown` changes
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "node monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("Shutdown signal received, stopping node monitor.");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "node sweep failed");
                    }
                }
            }
        }
    }

    pub async fn observation(&self, node_id: Uuid) -> Option<NodeObservation> {
        self.cache.read().await.get(&node_id).cloned()
    }

    pub async fn observations(&self) -> HashMap<Uuid, NodeObservation> {
        self.cache.read().await.clone()
    }

    /// Whether the node has failed at least `failure_threshold` polls in a row
    pub async fn is_unreachable(&self, node_id: Uuid) -> bool {
        self.cache
            .read()
            .await
            .get(&node_id)
            .map_or(false, |o| o.consecutive_failures >= self.failure_threshold)
    }

    /// Drops cached state for a deleted node
    pub async fn forget(&self, node_id: Uuid) {
        self.cache.write().await.remove(&node_id);
    }

    pub async fn last_sweep(&self) -> Option<DateTime<Utc>> {
        *self.last_sweep.read().await
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Seeds the cache directly; used by reconciler tests
    #[cfg(test)]
    pub(crate) async fn observe(&self, node_id: Uuid, observation: NodeObservation) {
        self.cache.write().await.insert(node_id, observation);
    }
}
