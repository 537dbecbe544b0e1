//! Quota ledger
//!
//! Enforces per-user tunnel-slot and traffic limits derived from the user's
//! group (or the default group) and keeps the traffic counters. Slot checks
//! count tunnels the registry confirms as running plus in-flight reservations,
//! serialized per user so two concurrent starts cannot both take the last slot.
//! Traffic recording is serialized per user: the user total is shared by all
//! of a user's tunnels, and each (user, tunnel, day) summary row belongs to
//! exactly one user.

use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    locks::KeyedMutex,
    models::{GroupLimits, TrafficEntry, TrafficTotals, User},
    registry::Registry,
};

type PendingSlots = Arc<Mutex<HashMap<Uuid, HashSet<Uuid>>>>;

/// Which limit a request ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Tunnels,
    Traffic,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaViolation {
    pub kind: QuotaKind,
    pub limit: i64,
    pub used: i64,
    pub requested: i64,
}

impl std::fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            QuotaKind::Tunnels => write!(
                f,
                "running tunnel limit reached ({} of {} in use)",
                self.used, self.limit
            ),
            QuotaKind::Traffic => write!(
                f,
                "traffic limit reached ({} of {} bytes used, {} requested)",
                self.used, self.limit, self.requested
            ),
        }
    }
}

/// A tunnel slot held while a start is in flight. Dropping it frees the slot;
/// once the registry records the tunnel as running the slot is counted there.
#[derive(Debug)]
pub struct Reservation {
    user_id: Uuid,
    tunnel_id: Option<Uuid>,
    pending: PendingSlots,
}

impl Reservation {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(tunnel_id) = self.tunnel_id else {
            return;
        };
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slots) = pending.get_mut(&self.user_id) {
            slots.remove(&tunnel_id);
            if slots.is_empty() {
                pending.remove(&self.user_id);
            }
        }
    }
}

#[derive(Debug)]
pub enum QuotaDecision {
    Allowed(Reservation),
    Exceeded(QuotaViolation),
}

/// Limits and consumption for one user
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub user_id: Uuid,
    pub limits: GroupLimits,
    pub running_tunnels: i64,
    pub pending_tunnels: i64,
    pub remaining_tunnels: Option<i64>,
    pub total_traffic: i64,
    pub remaining_traffic: Option<i64>,
}

/// Result of recording a traffic sample
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub totals: TrafficTotals,
    /// Whether the user's cumulative traffic now exceeds their limit
    pub over_quota: bool,
}

pub struct QuotaLedger {
    registry: Arc<dyn Registry>,
    pending: PendingSlots,
    user_locks: KeyedMutex<Uuid>,
}

impl QuotaLedger {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            user_locks: KeyedMutex::new(),
        }
    }

    async fn load_user(&self, user_id: Uuid) -> AppResult<User> {
        self.registry
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    /// Resolves the limits that apply to `user`: own group, else the default
    /// group, else unlimited
    pub async fn effective_limits(&self, user: &User) -> AppResult<GroupLimits> {
        if let Some(group_id) = user.user_group_id {
            match self.registry.get_group(group_id).await? {
                Some(group) => return Ok(GroupLimits::from(&group)),
                None => warn!(
                    user_id = %user.id,
                    group_id = %group_id,
                    "user references a missing group, falling back to default group"
                ),
            }
        }

        match self.registry.get_default_group().await? {
            Some(group) => Ok(GroupLimits::from(&group)),
            None => {
                warn!(user_id = %user.id, "no default group configured, treating user as unlimited");
                Ok(GroupLimits::unlimited())
            }
        }
    }

    pub async fn limits_for_user(&self, user_id: Uuid) -> AppResult<GroupLimits> {
        let user = self.load_user(user_id).await?;
        self.effective_limits(&user).await
    }

    fn pending_for(&self, user_id: Uuid, excluding: Option<Uuid>) -> (i64, bool) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(&user_id) {
            Some(slots) => {
                let held = excluding.map_or(false, |id| slots.contains(&id));
                let others = slots.iter().filter(|id| Some(**id) != excluding).count();
                (others as i64, held)
            }
            None => (0, false),
        }
    }

    /// Number of in-flight reservations for a user
    pub fn pending_slots(&self, user_id: Uuid) -> i64 {
        self.pending_for(user_id, None).0
    }

    /// Checks whether `user_id` may take a tunnel slot for `tunnel_id` (when
    /// given) and consume `traffic_delta` more bytes. On success the slot is
    /// held until the returned reservation is dropped.
    pub async fn reserve(
        &self,
        user_id: Uuid,
        tunnel_id: Option<Uuid>,
        traffic_delta: i64,
    ) -> AppResult<QuotaDecision> {
        if traffic_delta < 0 {
            return Err(AppError::Validation("Traffic delta cannot be negative".to_string()));
        }

        let _guard = self.user_locks.lock(&user_id).await;

        let user = self.load_user(user_id).await?;
        let limits = self.effective_limits(&user).await?;

        if let Some(tunnel_id) = tunnel_id {
            let (pending, already_held) = self.pending_for(user_id, Some(tunnel_id));
            if already_held {
                return Err(AppError::Conflict(format!(
                    "Tunnel {} already holds a pending reservation",
                    tunnel_id
                )));
            }

            if let Some(max_tunnels) = limits.max_tunnels {
                let running = self
                    .registry
                    .count_running_tunnels(user_id, Some(tunnel_id))
                    .await?;
                let used = running + pending;
                if used + 1 > max_tunnels {
                    info!(
                        user_id = %user_id,
                        tunnel_id = %tunnel_id,
                        used,
                        limit = max_tunnels,
                        "tunnel slot denied"
                    );
                    return Ok(QuotaDecision::Exceeded(QuotaViolation {
                        kind: QuotaKind::Tunnels,
                        limit: max_tunnels,
                        used,
                        requested: 1,
                    }));
                }
            }
        }

        if let Some(max_traffic) = limits.max_traffic {
            let projected = user.total_traffic.checked_add(traffic_delta).ok_or_else(|| {
                error!(user_id = %user_id, traffic_delta, "traffic reservation overflows counter");
                AppError::InvariantViolation("Traffic counter would overflow".to_string())
            })?;
            if projected > max_traffic {
                info!(
                    user_id = %user_id,
                    total = user.total_traffic,
                    limit = max_traffic,
                    "traffic quota denied"
                );
                return Ok(QuotaDecision::Exceeded(QuotaViolation {
                    kind: QuotaKind::Traffic,
                    limit: max_traffic,
                    used: user.total_traffic,
                    requested: traffic_delta,
                }));
            }
        }

        if let Some(tunnel_id) = tunnel_id {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.entry(user_id).or_default().insert(tunnel_id);
        }

        debug!(user_id = %user_id, tunnel_id = ?tunnel_id, traffic_delta, "quota reserved");

        Ok(QuotaDecision::Allowed(Reservation {
            user_id,
            tunnel_id,
            pending: self.pending.clone(),
        }))
    }

    /// Limits, consumption and headroom for a user
    pub async fn usage(&self, user_id: Uuid) -> AppResult<QuotaUsage> {
        let user = self.load_user(user_id).await?;
        let limits = self.effective_limits(&user).await?;
        let running_tunnels = self.registry.count_running_tunnels(user_id, None).await?;
        let pending_tunnels = self.pending_slots(user_id);

        Ok(QuotaUsage {
            user_id,
            remaining_tunnels: limits
                .max_tunnels
                .map(|max| (max - running_tunnels - pending_tunnels).max(0)),
            remaining_traffic: limits
                .max_traffic
                .map(|max| (max - user.total_traffic).max(0)),
            limits,
            running_tunnels,
            pending_tunnels,
            total_traffic: user.total_traffic,
        })
    }

    /// Records a traffic sample for a user's tunnel: appends the log row and
    /// increments the user total, tunnel counters and daily summary atomically.
    /// Deltas that would overflow a 64-bit counter are rejected.
    pub async fn record_traffic(
        &self,
        user_id: Uuid,
        tunnel_id: Uuid,
        upload: i64,
        download: i64,
    ) -> AppResult<TrafficRecord> {
        if upload < 0 || download < 0 {
            return Err(AppError::Validation("Traffic values cannot be negative".to_string()));
        }
        let delta = upload.checked_add(download).ok_or_else(|| {
            AppError::InvariantViolation("Traffic sample overflows a 64-bit counter".to_string())
        })?;

        let entry = TrafficEntry {
            user_id,
            tunnel_id,
            upload,
            download,
            recorded_at: Utc::now(),
        };

        let guard = self.user_locks.lock(&user_id).await;

        let user = self.load_user(user_id).await?;
        let tunnel = self
            .registry
            .get_tunnel(tunnel_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("Tunnel {} not found", tunnel_id)))?;

        let overflow = user.total_traffic.checked_add(delta).is_none()
            || tunnel.bytes_in.checked_add(download).is_none()
            || tunnel.bytes_out.checked_add(upload).is_none();
        if overflow {
            error!(
                user_id = %user_id,
                tunnel_id = %tunnel_id,
                total = user.total_traffic,
                delta,
                "traffic sample would overflow counters, rejecting"
            );
            return Err(AppError::InvariantViolation(
                "Traffic counters would overflow".to_string(),
            ));
        }

        let totals = self.registry.apply_traffic(&entry).await?;
        drop(guard);
        self.user_locks.prune_idle();

        let limits = self.effective_limits(&user).await?;
        let over_quota = limits
            .max_traffic
            .map_or(false, |max| totals.user_total > max);
        if over_quota {
            warn!(
                user_id = %user_id,
                total = totals.user_total,
                limit = ?limits.max_traffic,
                "user exceeded traffic quota"
            );
        }

        Ok(TrafficRecord { totals, over_quota })
    }
}
