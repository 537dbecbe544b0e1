//! Database models and request/response types
//!
//! Data model for the panel: users and their quota groups, packages that
//! materialize into groups, proxy-server nodes, tunnel definitions, traffic
//! accounting and the audit trail. Models map 1:1 onto the PostgreSQL schema.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

// === Users and quota templates ===

/// Panel account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub real_name: Option<String>,
    pub phone: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
    pub user_group_id: Option<Uuid>,
    /// Cumulative bytes, never negative
    pub total_traffic: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Quota template assigned to users
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserGroup {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub max_tunnels: i32,
    pub max_traffic: i64,
    /// KB/s
    pub upload_limit: Option<i32>,
    /// KB/s
    pub download_limit: Option<i32>,
    pub is_default: bool,
    /// Set when the group was materialized from a package purchase
    pub package_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Group plus its member count, as listed by the groups endpoint
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserGroupWithCount {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub group: UserGroup,
    pub user_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    pub max_tunnels: Option<i32>,
    pub max_traffic: Option<i64>,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_tunnels: Option<i32>,
    pub max_traffic: Option<i64>,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
    pub is_default: Option<bool>,
}

/// Purchasable quota package
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Package {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_days: i32,
    pub max_tunnels: i32,
    pub max_traffic: i64,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePackageRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_days: i32,
    pub max_tunnels: i32,
    pub max_traffic: i64,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePackageRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub duration_days: Option<i32>,
    pub max_tunnels: Option<i32>,
    pub max_traffic: Option<i64>,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// A user's purchase of a package
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserPackage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub used_traffic: i64,
    pub payment_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Purchase joined with the package name for listings
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserPackageView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub purchase: UserPackage,
    pub package_name: String,
}

/// Limits a group change would replace, shown before the change is confirmed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupLimits {
    pub group_id: Option<Uuid>,
    pub group_name: Option<String>,
    pub max_tunnels: Option<i64>,
    pub max_traffic: Option<i64>,
    pub upload_limit: Option<i32>,
    pub download_limit: Option<i32>,
}

impl GroupLimits {
    pub fn unlimited() -> Self {
        Self {
            group_id: None,
            group_name: None,
            max_tunnels: None,
            max_traffic: None,
            upload_limit: None,
            download_limit: None,
        }
    }
}

impl From<&UserGroup> for GroupLimits {
    fn from(group: &UserGroup) -> Self {
        Self {
            group_id: Some(group.id),
            group_name: Some(group.name.clone()),
            max_tunnels: Some(group.max_tunnels as i64),
            max_traffic: Some(group.max_traffic),
            upload_limit: group.upload_limit,
            download_limit: group.download_limit,
        }
    }
}

impl From<&Package> for GroupLimits {
    fn from(package: &Package) -> Self {
        Self {
            group_id: None,
            group_name: Some(package.name.clone()),
            max_tunnels: Some(package.max_tunnels as i64),
            max_traffic: Some(package.max_traffic),
            upload_limit: package.upload_limit,
            download_limit: package.download_limit,
        }
    }
}

/// `None` means unlimited, so any concrete value is lower than it
fn is_lower<T: PartialOrd>(current: Option<T>, proposed: Option<T>) -> bool {
    match (current, proposed) {
        (None, Some(_)) => true,
        (Some(current), Some(proposed)) => proposed < current,
        (_, None) => false,
    }
}

impl GroupLimits {
    /// True when moving from `self` to `proposed` lowers any limit
    pub fn reduced_by(&self, proposed: &GroupLimits) -> bool {
        is_lower(self.max_tunnels, proposed.max_tunnels)
            || is_lower(self.max_traffic, proposed.max_traffic)
            || is_lower(self.upload_limit, proposed.upload_limit)
            || is_lower(self.download_limit, proposed.download_limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupChangePreview {
    pub user_id: Uuid,
    pub current: GroupLimits,
    pub proposed: GroupLimits,
    /// True when any limit in `proposed` is lower than in `current`
    pub reduces_limits: bool,
    pub running_tunnels: i64,
}

impl GroupChangePreview {
    pub fn new(user_id: Uuid, current: GroupLimits, proposed: GroupLimits, running_tunnels: i64) -> Self {
        Self {
            user_id,
            reduces_limits: current.reduced_by(&proposed),
            current,
            proposed,
            running_tunnels,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GroupChangeOutcome {
    ConfirmationRequired { preview: GroupChangePreview },
    Applied { previous: GroupLimits, current: GroupLimits },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    ConfirmationRequired { preview: GroupChangePreview },
    Applied { user_package: UserPackage, group: UserGroup, previous: GroupLimits },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurchaseRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignGroupRequest {
    pub user_group_id: Option<Uuid>,
    #[serde(default)]
    pub confirm: bool,
}

// === Accounts ===

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Username or email
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub real_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

/// Row shape used when creating accounts
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub user_group_id: Option<Uuid>,
}

// === Nodes ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "node_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
    Unknown,
}

impl NodeStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, NodeStatus::Offline | NodeStatus::Error)
    }
}

/// Proxy-server endpoint tunnels are registered on
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub dashboard_port: Option<i32>,
    pub dashboard_user: Option<String>,
    #[serde(skip_serializing)]
    pub dashboard_password: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub status: NodeStatus,
    pub region: Option<String>,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Base URL of the node's dashboard API, if one is configured
    pub fn dashboard_url(&self) -> Option<String> {
        self.dashboard_port
            .map(|port| format!("http://{}:{}", self.host, port))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub host: String,
    pub port: Option<i32>,
    pub dashboard_port: Option<i32>,
    pub dashboard_user: Option<String>,
    pub dashboard_password: Option<String>,
    pub token: Option<String>,
    pub region: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNodeRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub dashboard_port: Option<i32>,
    pub dashboard_user: Option<String>,
    pub dashboard_password: Option<String>,
    pub token: Option<String>,
    pub region: Option<String>,
    pub description: Option<String>,
}

// === Tunnels ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "tunnel_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Udp,
    Http,
    Https,
}

impl TunnelType {
    pub const ALL: [TunnelType; 4] = [TunnelType::Tcp, TunnelType::Udp, TunnelType::Http, TunnelType::Https];

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelType::Tcp => "tcp",
            TunnelType::Udp => "udp",
            TunnelType::Http => "http",
            TunnelType::Https => "https",
        }
    }

    /// Port-based types expose a remote port, the others are routed by host name
    pub fn uses_remote_port(self) -> bool {
        matches!(self, TunnelType::Tcp | TunnelType::Udp)
    }
}

/// Last status confirmed by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "tunnel_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Running,
    Stopped,
    Error,
}

/// Status a user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "desired_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tunnel {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_ip: String,
    pub local_port: i32,
    pub remote_port: Option<i32>,
    pub custom_domains: Vec<String>,
    pub subdomain: Option<String>,
    pub description: Option<String>,
    pub status: TunnelStatus,
    pub desired_status: DesiredState,
    pub last_error: Option<String>,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub node_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tunnel {
    /// Name the proxy is registered under on its node
    pub fn proxy_name(&self) -> String {
        proxy_name_for(self.id)
    }
}

/// Derived from the id so renaming a tunnel never orphans its proxy
pub fn proxy_name_for(tunnel_id: Uuid) -> String {
    format!("tunnel-{}", tunnel_id.simple())
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTunnelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_ip: Option<String>,
    pub local_port: i32,
    pub remote_port: Option<i32>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    pub subdomain: Option<String>,
    pub description: Option<String>,
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTunnelRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub tunnel_type: Option<TunnelType>,
    pub local_ip: Option<String>,
    pub local_port: Option<i32>,
    pub remote_port: Option<i32>,
    pub custom_domains: Option<Vec<String>>,
    /// An empty string clears the subdomain
    pub subdomain: Option<String>,
    /// An empty string clears the description
    pub description: Option<String>,
}

/// Row shape used when inserting tunnels
#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub local_ip: String,
    pub local_port: i32,
    pub remote_port: Option<i32>,
    pub custom_domains: Vec<String>,
    pub subdomain: Option<String>,
    pub description: Option<String>,
    pub node_id: Uuid,
    pub user_id: Uuid,
}

/// Full configuration written by a tunnel edit, after merging the request
/// into the stored row
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelEdit {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub local_ip: String,
    pub local_port: i32,
    pub remote_port: Option<i32>,
    pub custom_domains: Vec<String>,
    pub subdomain: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelFilter {
    pub node_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub tunnel_type: Option<TunnelType>,
    pub status: Option<TunnelStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    Start,
    Stop,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub tunnel_ids: Vec<Uuid>,
    pub operation: BatchOperation,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteTunnelQuery {
    /// Admin only: delete even if the node cannot deregister the proxy
    #[serde(default)]
    pub force: bool,
}

// === Traffic ===

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrafficLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tunnel_id: Uuid,
    pub upload: i64,
    pub download: i64,
    pub timestamp: DateTime<Utc>,
}

/// One row per (user, tunnel, day)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrafficSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tunnel_id: Uuid,
    pub date: NaiveDate,
    pub upload: i64,
    pub download: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated traffic sample ready to be applied atomically
#[derive(Debug, Clone)]
pub struct TrafficEntry {
    pub user_id: Uuid,
    pub tunnel_id: Uuid,
    pub upload: i64,
    pub download: i64,
    pub recorded_at: DateTime<Utc>,
}

impl TrafficEntry {
    pub fn day(&self) -> NaiveDate {
        self.recorded_at.date_naive()
    }
}

/// Counters after a traffic sample was applied
#[derive(Debug, Clone, Serialize)]
pub struct TrafficTotals {
    pub user_total: i64,
    pub tunnel_bytes_in: i64,
    pub tunnel_bytes_out: i64,
    pub summary: TrafficSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficLogRequest {
    pub tunnel_id: Uuid,
    #[serde(default)]
    pub upload: i64,
    #[serde(default)]
    pub download: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DailyTrafficQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DailyTraffic {
    pub date: NaiveDate,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TunnelTrafficTotal {
    pub tunnel_id: Uuid,
    pub tunnel_name: String,
    pub upload: i64,
    pub download: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficOverview {
    pub total_upload: i64,
    pub total_download: i64,
    pub total_traffic: i64,
    pub tunnels: Vec<TunnelTrafficTotal>,
}

// === Audit trail ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "operation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OperationLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperationLog {
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: OperationStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationLogQuery {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub status: Option<OperationStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Generic pagination parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub fn limit_or(&self, default: i64, max: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, max)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_name_is_stable_across_renames() {
        let id = Uuid::new_v4();
        assert_eq!(proxy_name_for(id), format!("tunnel-{}", id.simple()));
        assert_eq!(proxy_name_for(id).len(), "tunnel-".len() + 32);
    }

    #[test]
    fn test_tunnel_type_serde_names() {
        let parsed: TunnelType = serde_json::from_str("\"https\"").unwrap();
        assert_eq!(parsed, TunnelType::Https);
        assert!(TunnelType::Tcp.uses_remote_port());
        assert!(!TunnelType::Http.uses_remote_port());
        assert!(serde_json::from_str::<TunnelType>("\"sctp\"").is_err());
    }

    #[test]
    fn test_group_limits_from_group() {
        let group = UserGroup {
            id: Uuid::new_v4(),
            name: "basic".to_string(),
            description: None,
            max_tunnels: 5,
            max_traffic: 5 * 1024 * 1024 * 1024,
            upload_limit: Some(512),
            download_limit: None,
            is_default: false,
            package_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let limits = GroupLimits::from(&group);
        assert_eq!(limits.max_tunnels, Some(5));
        assert_eq!(limits.upload_limit, Some(512));
        assert_eq!(GroupLimits::unlimited().max_traffic, None);
    }

    #[test]
    fn test_preview_flags_lowered_limits() {
        let unlimited = GroupLimits::unlimited();
        let small = GroupLimits { max_tunnels: Some(3), max_traffic: Some(1024), ..GroupLimits::unlimited() };
        let large = GroupLimits { max_tunnels: Some(10), max_traffic: Some(4096), ..GroupLimits::unlimited() };

        assert!(GroupChangePreview::new(Uuid::new_v4(), unlimited.clone(), small.clone(), 0).reduces_limits);
        assert!(GroupChangePreview::new(Uuid::new_v4(), large.clone(), small.clone(), 2).reduces_limits);
        assert!(!GroupChangePreview::new(Uuid::new_v4(), small, large.clone(), 2).reduces_limits);
        assert!(!GroupChangePreview::new(Uuid::new_v4(), large, unlimited, 2).reduces_limits);
    }

    #[test]
    fn test_pagination_clamps() {
        let p = Pagination { limit: Some(10_000), offset: Some(-4) };
        assert_eq!(p.limit_or(50, 200), 200);
        assert_eq!(p.offset(), 0);
        assert_eq!(Pagination::default().limit_or(50, 200), 50);
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let user = User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "secret-hash".to_string(),
            real_name: None,
            phone: None,
            is_admin: false,
            is_active: true,
            user_group_id: None,
            total_traffic: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login: None,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
    }
}
