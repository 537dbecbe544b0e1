//! Registry contract
//!
//! The source of truth the quota ledger, node monitor and tunnel reconciler
//! read from and write to. `database::Database` implements it on PostgreSQL;
//! every method that writes more than one row does so atomically.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    DesiredState, Node, NodeStatus, TrafficEntry, TrafficTotals, Tunnel, TunnelStatus, User,
    UserGroup,
};

/// A traffic counter would no longer fit in 64 bits. Nothing was written.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("traffic counter would exceed 64 bits")]
pub struct CounterOverflow;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;

    async fn get_group(&self, group_id: Uuid) -> Result<Option<UserGroup>>;

    /// The group flagged `is_default`, if any
    async fn get_default_group(&self) -> Result<Option<UserGroup>>;

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Stores the latest observed node status and when it was observed
    async fn record_node_status(
        &self,
        node_id: Uuid,
        status: NodeStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_tunnel(&self, tunnel_id: Uuid) -> Result<Option<Tunnel>>;

    async fn list_all_tunnels(&self) -> Result<Vec<Tunnel>>;

    async fn list_user_tunnels(&self, user_id: Uuid) -> Result<Vec<Tunnel>>;

    /// Tunnels whose confirmed status is `running`, optionally excluding one
    async fn count_running_tunnels(&self, user_id: Uuid, excluding: Option<Uuid>) -> Result<i64>;

    async fn set_desired_status(&self, tunnel_id: Uuid, desired: DesiredState) -> Result<()>;

    /// Writes the confirmed status snapshot and the last error (cleared with `None`)
    async fn record_tunnel_status(
        &self,
        tunnel_id: Uuid,
        status: TunnelStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Returns false when the tunnel did not exist
    async fn delete_tunnel(&self, tunnel_id: Uuid) -> Result<bool>;

    /// Appends the traffic log row, bumps the user and tunnel counters and
    /// upserts the daily summary in one transaction. Fails with
    /// [`CounterOverflow`] when any counter would overflow.
    async fn apply_traffic(&self, entry: &TrafficEntry) -> Result<TrafficTotals>;
}

#[cfg(test)]
pub mod memory {
    //! In-memory registry used by the ledger and reconciler tests

    use super::*;
    use crate::models::{TrafficLog, TrafficSummary, TunnelType};
    use chrono::NaiveDate;
    use std::{collections::HashMap, sync::Mutex};

    #[derive(Default)]
    struct Tables {
        users: HashMap<Uuid, User>,
        groups: HashMap<Uuid, UserGroup>,
        nodes: HashMap<Uuid, Node>,
        tunnels: HashMap<Uuid, Tunnel>,
        traffic_logs: Vec<TrafficLog>,
        summaries: HashMap<(Uuid, Uuid, NaiveDate), TrafficSummary>,
    }

    #[derive(Default)]
    pub struct MemoryRegistry {
        tables: Mutex<Tables>,
    }

    impl MemoryRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_group(&self, name: &str, max_tunnels: i32, max_traffic: i64, is_default: bool) -> UserGroup {
            let now = Utc::now();
            let group = UserGroup {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: None,
                max_tunnels,
                max_traffic,
                upload_limit: None,
                download_limit: None,
                is_default,
                package_id: None,
                created_at: now,
                updated_at: now,
            };
            self.tables.lock().unwrap().groups.insert(group.id, group.clone());
            group
        }

        pub fn add_user(&self, username: &str, group_id: Option<Uuid>) -> User {
            let now = Utc::now();
            let user = User {
                id: Uuid::new_v4(),
                username: username.to_string(),
                email: format!("{}@example.com", username),
                password_hash: String::new(),
                real_name: None,
                phone: None,
                is_admin: false,
                is_active: true,
                user_group_id: group_id,
                total_traffic: 0,
                created_at: now,
                updated_at: now,
                last_login: None,
            };
            self.tables.lock().unwrap().users.insert(user.id, user.clone());
            user
        }

        pub fn set_user_traffic(&self, user_id: Uuid, total: i64) {
            if let Some(user) = self.tables.lock().unwrap().users.get_mut(&user_id) {
                user.total_traffic = total;
            }
        }

        pub fn add_node(&self, name: &str, host: &str, dashboard_port: Option<i32>) -> Node {
            let now = Utc::now();
            let node = Node {
                id: Uuid::new_v4(),
                name: name.to_string(),
                host: host.to_string(),
                port: 7000,
                dashboard_port,
                dashboard_user: None,
                dashboard_password: None,
                token: None,
                status: NodeStatus::Unknown,
                region: None,
                description: None,
                owner_id: Uuid::new_v4(),
                last_checked_at: None,
                created_at: now,
                updated_at: now,
            };
            self.tables.lock().unwrap().nodes.insert(node.id, node.clone());
            node
        }

        pub fn add_tunnel(&self, name: &str, user_id: Uuid, node_id: Uuid, status: TunnelStatus) -> Tunnel {
            let now = Utc::now();
            let tunnel = Tunnel {
                id: Uuid::new_v4(),
                name: name.to_string(),
                tunnel_type: TunnelType::Tcp,
                local_ip: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: Some(6000),
                custom_domains: Vec::new(),
                subdomain: None,
                description: None,
                status,
                desired_status: match status {
                    TunnelStatus::Running => DesiredState::Running,
                    _ => DesiredState::Stopped,
                },
                last_error: None,
                bytes_in: 0,
                bytes_out: 0,
                node_id,
                user_id,
                created_at: now,
                updated_at: now,
            };
            self.tables.lock().unwrap().tunnels.insert(tunnel.id, tunnel.clone());
            tunnel
        }

        pub fn set_tunnel_counters(&self, tunnel_id: Uuid, bytes_in: i64, bytes_out: i64) {
            if let Some(tunnel) = self.tables.lock().unwrap().tunnels.get_mut(&tunnel_id) {
                tunnel.bytes_in = bytes_in;
                tunnel.bytes_out = bytes_out;
            }
        }

        pub fn tunnel(&self, tunnel_id: Uuid) -> Option<Tunnel> {
            self.tables.lock().unwrap().tunnels.get(&tunnel_id).cloned()
        }

        pub fn user(&self, user_id: Uuid) -> Option<User> {
            self.tables.lock().unwrap().users.get(&user_id).cloned()
        }

        pub fn node(&self, node_id: Uuid) -> Option<Node> {
            self.tables.lock().unwrap().nodes.get(&node_id).cloned()
        }

        pub fn summaries(&self) -> Vec<TrafficSummary> {
            self.tables.lock().unwrap().summaries.values().cloned().collect()
        }

        pub fn traffic_log_count(&self) -> usize {
            self.tables.lock().unwrap().traffic_logs.len()
        }
    }

    #[async_trait]
    impl Registry for MemoryRegistry {
        async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
            Ok(self.tables.lock().unwrap().users.get(&user_id).cloned())
        }

        async fn get_group(&self, group_id: Uuid) -> Result<Option<UserGroup>> {
            Ok(self.tables.lock().unwrap().groups.get(&group_id).cloned())
        }

        async fn get_default_group(&self) -> Result<Option<UserGroup>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .groups
                .values()
                .find(|g| g.is_default)
                .cloned())
        }

        async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
            Ok(self.tables.lock().unwrap().nodes.get(&node_id).cloned())
        }

        async fn list_nodes(&self) -> Result<Vec<Node>> {
            Ok(self.tables.lock().unwrap().nodes.values().cloned().collect())
        }

        async fn record_node_status(
            &self,
            node_id: Uuid,
            status: NodeStatus,
            checked_at: DateTime<Utc>,
        ) -> Result<()> {
            if let Some(node) = self.tables.lock().unwrap().nodes.get_mut(&node_id) {
                node.status = status;
                node.last_checked_at = Some(checked_at);
            }
            Ok(())
        }

        async fn get_tunnel(&self, tunnel_id: Uuid) -> Result<Option<Tunnel>> {
            Ok(self.tables.lock().unwrap().tunnels.get(&tunnel_id).cloned())
        }

        async fn list_all_tunnels(&self) -> Result<Vec<Tunnel>> {
            Ok(self.tables.lock().unwrap().tunnels.values().cloned().collect())
        }

        async fn list_user_tunnels(&self, user_id: Uuid) -> Result<Vec<Tunnel>> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .tunnels
                .values()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn count_running_tunnels(&self, user_id: Uuid, excluding: Option<Uuid>) -> Result<i64> {
            Ok(self
                .tables
                .lock()
                .unwrap()
                .tunnels
                .values()
                .filter(|t| t.user_id == user_id && t.status == TunnelStatus::Running)
                .filter(|t| Some(t.id) != excluding)
                .count() as i64)
        }

        async fn set_desired_status(&self, tunnel_id: Uuid, desired: DesiredState) -> Result<()> {
            if let Some(tunnel) = self.tables.lock().unwrap().tunnels.get_mut(&tunnel_id) {
                tunnel.desired_status = desired;
            }
            Ok(())
        }

        async fn record_tunnel_status(
            &self,
            tunnel_id: Uuid,
            status: TunnelStatus,
            last_error: Option<&str>,
        ) -> Result<()> {
            if let Some(tunnel) = self.tables.lock().unwrap().tunnels.get_mut(&tunnel_id) {
                tunnel.status = status;
                tunnel.last_error = last_error.map(str::to_string);
                tunnel.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn delete_tunnel(&self, tunnel_id: Uuid) -> Result<bool> {
            Ok(self.tables.lock().unwrap().tunnels.remove(&tunnel_id).is_some())
        }

        async fn apply_traffic(&self, entry: &TrafficEntry) -> Result<TrafficTotals> {
            let mut tables = self.tables.lock().unwrap();
            let delta = entry
                .upload
                .checked_add(entry.download)
                .ok_or(CounterOverflow)?;

            let current_total = tables
                .users
                .get(&entry.user_id)
                .ok_or_else(|| anyhow::anyhow!("user not found"))?
                .total_traffic;
            let (current_in, current_out) = tables
                .tunnels
                .get(&entry.tunnel_id)
                .map(|t| (t.bytes_in, t.bytes_out))
                .ok_or_else(|| anyhow::anyhow!("tunnel not found"))?;
            let summary_key = (entry.user_id, entry.tunnel_id, entry.day());
            let (summary_up, summary_down) = tables
                .summaries
                .get(&summary_key)
                .map_or((0, 0), |s| (s.upload, s.download));

            let user_total = current_total.checked_add(delta).ok_or(CounterOverflow)?;
            let tunnel_bytes_in = current_in.checked_add(entry.download).ok_or(CounterOverflow)?;
            let tunnel_bytes_out = current_out.checked_add(entry.upload).ok_or(CounterOverflow)?;
            summary_up.checked_add(entry.upload).ok_or(CounterOverflow)?;
            summary_down.checked_add(entry.download).ok_or(CounterOverflow)?;

            if let Some(user) = tables.users.get_mut(&entry.user_id) {
                user.total_traffic = user_total;
            }
            if let Some(tunnel) = tables.tunnels.get_mut(&entry.tunnel_id) {
                tunnel.bytes_in = tunnel_bytes_in;
                tunnel.bytes_out = tunnel_bytes_out;
            }

            tables.traffic_logs.push(TrafficLog {
                id: Uuid::new_v4(),
                user_id: entry.user_id,
                tunnel_id: entry.tunnel_id,
                upload: entry.upload,
                download: entry.download,
                timestamp: entry.recorded_at,
            });

            let now = Utc::now();
            let summary = tables
                .summaries
                .entry(summary_key)
                .or_insert_with(|| TrafficSummary {
                    id: Uuid::new_v4(),
                    user_id: entry.user_id,
                    tunnel_id: entry.tunnel_id,
                    date: entry.day(),
                    upload: 0,
                    download: 0,
                    created_at: now,
                    updated_at: now,
                });
            summary.upload += entry.upload;
            summary.download += entry.download;
            summary.updated_at = now;

            Ok(TrafficTotals {
                user_total,
                tunnel_bytes_in,
                tunnel_bytes_out,
                summary: summary.clone(),
            })
        }
    }
}
