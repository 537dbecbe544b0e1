//! Tunnel reconciler
//!
//! Owns the per-tunnel state machine and drives tunnels toward the state their
//! owners asked for by registering and deregistering proxies on nodes.
//!
//! Operations on one tunnel are serialized by a per-tunnel lock. Every request
//! takes a sequence number when it arrives; an operation that finds a newer
//! number after acquiring the lock, or between retries, gives up instead of
//! overwriting the newer request's outcome. The registry only ever holds the
//! last confirmed status, written after the node command resolves.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::sync::{watch, RwLock as AsyncRwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ReconcilerConfig,
    error::{AppError, AppResult},
    ledger::{QuotaDecision, QuotaLedger},
    locks::KeyedMutex,
    models::{BatchOperation, DesiredState, Node, Tunnel, TunnelStatus},
    monitor::{NodeMonitor, NodeObservation},
    node_client::{ControlError, NodeControl, ProxyConfig},
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl TunnelPhase {
    /// `Error -> Stopped` is only taken when no command reached the node
    pub fn can_transition_to(self, next: TunnelPhase) -> bool {
        use TunnelPhase::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Starting)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }

    /// Phase implied by a confirmed status when nothing is held in memory
    pub fn from_status(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Running => TunnelPhase::Running,
            TunnelStatus::Stopped => TunnelPhase::Stopped,
            TunnelStatus::Error => TunnelPhase::Error,
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, TunnelPhase::Starting | TunnelPhase::Stopping)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSnapshot {
    pub phase: TunnelPhase,
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

struct PhaseRecord {
    phase: TunnelPhase,
    reason: Option<String>,
    since: DateTime<Utc>,
    changed: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub tunnel_id: Uuid,
    pub phase: TunnelPhase,
    /// False when the tunnel was already in the requested state
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemOutcome {
    pub tunnel_id: Uuid,
    pub success: bool,
    pub phase: Option<TunnelPhase>,
    pub error_code: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub operation: BatchOperation,
    pub results: Vec<BatchItemOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub skipped: usize,
    pub restarted: usize,
    pub stopped: usize,
    pub marked_error: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn changed(&self) -> bool {
        self.restarted + self.stopped + self.marked_error + self.failed > 0
    }
}

enum ReconcileAction {
    Unchanged,
    Skipped,
    Restarted,
    Stopped,
    MarkedError,
    Failed,
}

enum CommandFailure {
    Superseded,
    Failed(ControlError),
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    ledger: Arc<QuotaLedger>,
    monitor: Arc<NodeMonitor>,
    control: Arc<dyn NodeControl>,
    config: ReconcilerConfig,
    locks: KeyedMutex<Uuid>,
    phases: RwLock<HashMap<Uuid, PhaseRecord>>,
    sequence: AtomicU64,
    latest: Mutex<HashMap<Uuid, u64>>,
    last_pass: AsyncRwLock<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        ledger: Arc<QuotaLedger>,
        monitor: Arc<NodeMonitor>,
        control: Arc<dyn NodeControl>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            monitor,
            control,
            config,
            locks: KeyedMutex::new(),
            phases: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            latest: Mutex::new(HashMap::new()),
            last_pass: AsyncRwLock::new(None),
        }
    }

    // --- sequencing ---

    fn issue_sequence(&self, tunnel_id: Uuid) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tunnel_id, seq);
        seq
    }

    fn current_sequence(&self, tunnel_id: Uuid) -> u64 {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tunnel_id)
            .copied()
            .unwrap_or(0)
    }

    fn is_current(&self, tunnel_id: Uuid, seq: u64) -> bool {
        self.current_sequence(tunnel_id) == seq
    }

    fn superseded(tunnel_id: Uuid) -> AppError {
        AppError::Conflict(format!(
            "Request for tunnel {} was superseded by a newer request",
            tunnel_id
        ))
    }

    fn ensure_current(&self, tunnel_id: Uuid, seq: u64) -> AppResult<()> {
        if self.is_current(tunnel_id, seq) {
            Ok(())
        } else {
            debug!(tunnel_id = %tunnel_id, seq, "request superseded before it ran");
            Err(Self::superseded(tunnel_id))
        }
    }

    // --- phases ---

    fn current_phase(&self, tunnel: &Tunnel) -> TunnelPhase {
        self.phases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tunnel.id)
            .map(|record| record.phase)
            .unwrap_or_else(|| TunnelPhase::from_status(tunnel.status))
    }

    /// In-memory phase of a tunnel, falling back to its confirmed status
    pub fn phase(&self, tunnel: &Tunnel) -> PhaseSnapshot {
        let phases = self.phases.read().unwrap_or_else(|e| e.into_inner());
        match phases.get(&tunnel.id) {
            Some(record) => PhaseSnapshot {
                phase: record.phase,
                reason: record.reason.clone(),
                since: record.since,
            },
            None => PhaseSnapshot {
                phase: TunnelPhase::from_status(tunnel.status),
                reason: tunnel.last_error.clone(),
                since: tunnel.updated_at,
            },
        }
    }

    fn transition(&self, tunnel: &Tunnel, to: TunnelPhase, reason: Option<String>) -> AppResult<()> {
        let mut phases = self.phases.write().unwrap_or_else(|e| e.into_inner());
        let from = phases
            .get(&tunnel.id)
            .map(|record| record.phase)
            .unwrap_or_else(|| TunnelPhase::from_status(tunnel.status));

        if !from.can_transition_to(to) {
            error!(tunnel_id = %tunnel.id, from = ?from, to = ?to, "illegal tunnel transition");
            return Err(AppError::InvariantViolation(format!(
                "Tunnel {} cannot move from {:?} to {:?}",
                tunnel.id, from, to
            )));
        }

        debug!(tunnel_id = %tunnel.id, from = ?from, to = ?to, "tunnel transition");
        phases.insert(
            tunnel.id,
            PhaseRecord {
                phase: to,
                reason,
                since: Utc::now(),
                changed: Instant::now(),
            },
        );
        Ok(())
    }

    /// An operation dropped mid-flight leaves a transient phase behind
    fn settle_interrupted(&self, tunnel: &Tunnel) -> AppResult<()> {
        if self.current_phase(tunnel).is_transient() {
            warn!(tunnel_id = %tunnel.id, "previous operation was interrupted");
            self.transition(
                tunnel,
                TunnelPhase::Error,
                Some("previous operation was interrupted".to_string()),
            )?;
        }
        Ok(())
    }

    fn within_grace(&self, tunnel_id: Uuid) -> bool {
        self.phases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tunnel_id)
            .map_or(false, |record| record.changed.elapsed() < self.config.grace_period())
    }

    fn forget(&self, tunnel_id: Uuid) {
        self.phases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tunnel_id);
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tunnel_id);
        self.locks.remove(&tunnel_id);
    }

    // --- registry access ---

    async fn load_tunnel(&self, tunnel_id: Uuid) -> AppResult<Tunnel> {
        self.registry
            .get_tunnel(tunnel_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Tunnel {} not found", tunnel_id)))
    }

    async fn load_node(&self, node_id: Uuid) -> AppResult<Node> {
        self.registry
            .get_node(node_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Node {} not found", node_id)))
    }

    // --- node commands ---

    /// Runs `command` with a per-attempt timeout, retrying transient failures
    /// with exponential backoff while `seq` is still the latest request
    async fn with_retries<F, Fut>(
        &self,
        tunnel_id: Uuid,
        seq: u64,
        action: &'static str,
        command: F,
    ) -> Result<(), CommandFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), ControlError>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = ControlError::Timeout;

        for attempt in 1..=attempts {
            if !self.is_current(tunnel_id, seq) {
                debug!(tunnel_id = %tunnel_id, action, attempt, "command superseded, abandoning retries");
                return Err(CommandFailure::Superseded);
            }

            match tokio::time::timeout(self.config.control_timeout(), command()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if !e.is_transient() => return Err(CommandFailure::Failed(e)),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = ControlError::Timeout,
            }

            if attempt < attempts {
                let delay = self.config.retry_base() * 2u32.pow(attempt - 1);
                warn!(
                    tunnel_id = %tunnel_id,
                    action,
                    attempt,
                    error = %last_error,
                    "node command failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(CommandFailure::Failed(last_error))
    }

    // --- transitions ---

    async fn drive_start(&self, tunnel: &Tunnel, seq: u64) -> AppResult<TransitionOutcome> {
        self.settle_interrupted(tunnel)?;
        if self.current_phase(tunnel) == TunnelPhase::Running {
            debug!(tunnel_id = %tunnel.id, "tunnel already running");
            return Ok(TransitionOutcome {
                tunnel_id: tunnel.id,
                phase: TunnelPhase::Running,
                changed: false,
            });
        }

        self.transition(tunnel, TunnelPhase::Starting, None)?;

        let reservation = match self.ledger.reserve(tunnel.user_id, Some(tunnel.id), 0).await {
            Ok(QuotaDecision::Allowed(reservation)) => reservation,
            Ok(QuotaDecision::Exceeded(violation)) => {
                let reason = violation.to_string();
                info!(tunnel_id = %tunnel.id, user_id = %tunnel.user_id, %reason, "start denied by quota");
                self.transition(tunnel, TunnelPhase::Error, Some(format!("quota exceeded: {}", reason)))?;
                self.registry
                    .set_desired_status(tunnel.id, DesiredState::Stopped)
                    .await?;
                self.registry
                    .record_tunnel_status(tunnel.id, TunnelStatus::Stopped, Some(&reason))
                    .await?;
                // nothing was sent to the node, so the tunnel is stopped again
                self.transition(tunnel, TunnelPhase::Stopped, Some(format!("quota exceeded: {}", reason)))?;
                return Err(AppError::QuotaExceeded(reason));
            }
            Err(e) => {
                self.transition(tunnel, TunnelPhase::Error, Some(e.to_string()))?;
                return Err(e);
            }
        };

        let prepared = async {
            let node = self.load_node(tunnel.node_id).await?;
            let limits = self.ledger.limits_for_user(tunnel.user_id).await?;
            Ok::<_, AppError>((node, limits))
        }
        .await;
        let (node, limits) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.transition(tunnel, TunnelPhase::Error, Some(e.to_string()))?;
                return Err(e);
            }
        };

        let config = ProxyConfig::from_tunnel(tunnel, &limits);
        let control = self.control.as_ref();
        let (node_ref, config_ref) = (&node, &config);
        let result = self
            .with_retries(tunnel.id, seq, "register", move || {
                control.register_proxy(node_ref, config_ref)
            })
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .registry
                    .record_tunnel_status(tunnel.id, TunnelStatus::Running, None)
                    .await
                {
                    self.transition(tunnel, TunnelPhase::Error, Some("status not recorded".to_string()))?;
                    return Err(e.into());
                }
                drop(reservation);
                self.transition(tunnel, TunnelPhase::Running, None)?;
                info!(tunnel_id = %tunnel.id, node = %node.name, proxy = %config.name, "tunnel running");
                Ok(TransitionOutcome {
                    tunnel_id: tunnel.id,
                    phase: TunnelPhase::Running,
                    changed: true,
                })
            }
            Err(CommandFailure::Superseded) => {
                self.transition(
                    tunnel,
                    TunnelPhase::Error,
                    Some("superseded by a newer request".to_string()),
                )?;
                Err(Self::superseded(tunnel.id))
            }
            Err(CommandFailure::Failed(e)) => {
                let message = e.to_string();
                warn!(tunnel_id = %tunnel.id, node = %node.name, error = %message, "tunnel failed to start");
                self.transition(tunnel, TunnelPhase::Error, Some(message.clone()))?;
                drop(reservation);
                self.registry
                    .record_tunnel_status(tunnel.id, TunnelStatus::Error, Some(&message))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn drive_stop(&self, tunnel: &Tunnel, seq: u64) -> AppResult<TransitionOutcome> {
        self.settle_interrupted(tunnel)?;
        if self.current_phase(tunnel) == TunnelPhase::Stopped {
            debug!(tunnel_id = %tunnel.id, "tunnel already stopped");
            return Ok(TransitionOutcome {
                tunnel_id: tunnel.id,
                phase: TunnelPhase::Stopped,
                changed: false,
            });
        }

        self.transition(tunnel, TunnelPhase::Stopping, None)?;

        let node = match self.load_node(tunnel.node_id).await {
            Ok(node) => node,
            Err(e) => {
                self.transition(tunnel, TunnelPhase::Error, Some(e.to_string()))?;
                return Err(e);
            }
        };

        let name = tunnel.proxy_name();
        let control = self.control.as_ref();
        let (node_ref, name_ref) = (&node, name.as_str());
        let result = self
            .with_retries(tunnel.id, seq, "deregister", move || {
                control.deregister_proxy(node_ref, name_ref)
            })
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = self
                    .registry
                    .record_tunnel_status(tunnel.id, TunnelStatus::Stopped, None)
                    .await
                {
                    self.transition(tunnel, TunnelPhase::Error, Some("status not recorded".to_string()))?;
                    return Err(e.into());
                }
                self.transition(tunnel, TunnelPhase::Stopped, None)?;
                info!(tunnel_id = %tunnel.id, node = %node.name, "tunnel stopped");
                Ok(TransitionOutcome {
                    tunnel_id: tunnel.id,
                    phase: TunnelPhase::Stopped,
                    changed: true,
                })
            }
            Err(CommandFailure::Superseded) => {
                self.transition(
                    tunnel,
                    TunnelPhase::Error,
                    Some("superseded by a newer request".to_string()),
                )?;
                Err(Self::superseded(tunnel.id))
            }
            Err(CommandFailure::Failed(e)) => {
                let message = e.to_string();
                warn!(tunnel_id = %tunnel.id, node = %node.name, error = %message, "tunnel failed to stop");
                self.transition(tunnel, TunnelPhase::Error, Some(message.clone()))?;
                // the proxy may still be live, so the confirmed status is left as it was
                self.registry
                    .record_tunnel_status(tunnel.id, tunnel.status, Some(&message))
                    .await?;
                Err(e.into())
            }
        }
    }

    // --- public operations ---

    /// Marks a tunnel as wanted and registers its proxy on the node
    pub async fn request_start(&self, tunnel_id: Uuid) -> AppResult<TransitionOutcome> {
        let seq = self.issue_sequence(tunnel_id);
        let _guard = self.locks.lock(&tunnel_id).await;
        self.ensure_current(tunnel_id, seq)?;

        let tunnel = self.load_tunnel(tunnel_id).await?;
        self.registry
            .set_desired_status(tunnel_id, DesiredState::Running)
            .await?;
        self.drive_start(&tunnel, seq).await
    }

    /// Marks a tunnel as unwanted and removes its proxy from the node
    pub async fn request_stop(&self, tunnel_id: Uuid) -> AppResult<TransitionOutcome> {
        let seq = self.issue_sequence(tunnel_id);
        let _guard = self.locks.lock(&tunnel_id).await;
        self.ensure_current(tunnel_id, seq)?;

        let tunnel = self.load_tunnel(tunnel_id).await?;
        self.registry
            .set_desired_status(tunnel_id, DesiredState::Stopped)
            .await?;
        self.drive_stop(&tunnel, seq).await
    }

    /// Stops the tunnel if needed, then removes it from the registry. A tunnel
    /// whose proxy cannot be removed is kept.
    pub async fn delete(&self, tunnel_id: Uuid) -> AppResult<Tunnel> {
        self.remove(tunnel_id, false).await
    }

    /// Like `delete`, but removes the tunnel even when its node cannot be
    /// reached to deregister the proxy. Clears tunnels left on a node that is
    /// gone for good, which would otherwise block deleting that node.
    pub async fn force_delete(&self, tunnel_id: Uuid) -> AppResult<Tunnel> {
        self.remove(tunnel_id, true).await
    }

    async fn remove(&self, tunnel_id: Uuid, force: bool) -> AppResult<Tunnel> {
        let seq = self.issue_sequence(tunnel_id);
        let guard = self.locks.lock(&tunnel_id).await;
        self.ensure_current(tunnel_id, seq)?;

        let tunnel = self.load_tunnel(tunnel_id).await?;
        if tunnel.desired_status == DesiredState::Running {
            self.registry
                .set_desired_status(tunnel_id, DesiredState::Stopped)
                .await?;
        }
        if tunnel.status != TunnelStatus::Stopped || self.current_phase(&tunnel) != TunnelPhase::Stopped {
            match self.drive_stop(&tunnel, seq).await {
                Ok(_) => {}
                Err(e) if force && !matches!(e, AppError::Conflict(_)) => {
                    warn!(
                        tunnel_id = %tunnel_id,
                        node_id = %tunnel.node_id,
                        error = %e,
                        "proxy not deregistered, force deleting tunnel"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !self.registry.delete_tunnel(tunnel_id).await? {
            return Err(AppError::NotFound(format!("Tunnel {} not found", tunnel_id)));
        }
        drop(guard);
        self.forget(tunnel_id);

        info!(tunnel_id = %tunnel_id, user_id = %tunnel.user_id, force, "tunnel deleted");
        Ok(tunnel)
    }

    /// Runs `edit` while holding the tunnel's lock. Refused while the tunnel
    /// is running, wanted running or mid-transition.
    pub async fn edit_stopped<T, F, Fut>(&self, tunnel_id: Uuid, edit: F) -> AppResult<T>
    where
        F: FnOnce(Tunnel) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let _guard = self.locks.lock(&tunnel_id).await;
        let tunnel = self.load_tunnel(tunnel_id).await?;

        let phase = self.current_phase(&tunnel);
        if tunnel.status == TunnelStatus::Running
            || tunnel.desired_status == DesiredState::Running
            || phase == TunnelPhase::Running
            || phase.is_transient()
        {
            return Err(AppError::Conflict(format!(
                "Tunnel {} must be stopped before its configuration can change",
                tunnel_id
            )));
        }
        edit(tunnel).await
    }

    async fn batch_item(
        &self,
        tunnel_id: Uuid,
        operation: BatchOperation,
        owner: Option<Uuid>,
    ) -> BatchItemOutcome {
        let result: AppResult<Option<TunnelPhase>> = async {
            if let Some(owner) = owner {
                let tunnel = self.load_tunnel(tunnel_id).await?;
                if tunnel.user_id != owner {
                    return Err(AppError::NotFound(format!("Tunnel {} not found", tunnel_id)));
                }
            }
            match operation {
                BatchOperation::Start => self.request_start(tunnel_id).await.map(|o| Some(o.phase)),
                BatchOperation::Stop => self.request_stop(tunnel_id).await.map(|o| Some(o.phase)),
                BatchOperation::Delete => self.delete(tunnel_id).await.map(|_| None),
            }
        }
        .await;

        match result {
            Ok(phase) => BatchItemOutcome {
                tunnel_id,
                success: true,
                phase,
                error_code: None,
                message: match operation {
                    BatchOperation::Start => "started",
                    BatchOperation::Stop => "stopped",
                    BatchOperation::Delete => "deleted",
                }
                .to_string(),
            },
            Err(e) => BatchItemOutcome {
                tunnel_id,
                success: false,
                phase: None,
                error_code: Some(e.code()),
                message: e.public_message(),
            },
        }
    }

    /// Applies `operation` to each tunnel independently. With `owner` set,
    /// tunnels belonging to someone else are reported as not found.
    pub async fn batch(
        &self,
        tunnel_ids: Vec<Uuid>,
        operation: BatchOperation,
        owner: Option<Uuid>,
    ) -> BatchOutcome {
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = tunnel_ids.into_iter().filter(|id| seen.insert(*id)).collect();

        let results = join_all(
            unique
                .iter()
                .map(|&tunnel_id| self.batch_item(tunnel_id, operation, owner)),
        )
        .await;

        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        info!(operation = ?operation, success_count, failure_count, "batch operation finished");

        BatchOutcome {
            operation,
            results,
            success_count,
            failure_count,
        }
    }

    /// Stops every running tunnel of a user who went over their traffic limit
    pub async fn enforce_traffic_quota(&self, user_id: Uuid) -> AppResult<usize> {
        let tunnels = self.registry.list_user_tunnels(user_id).await?;
        let targets: Vec<&Tunnel> = tunnels
            .iter()
            .filter(|t| t.status == TunnelStatus::Running || t.desired_status == DesiredState::Running)
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        warn!(user_id = %user_id, tunnels = targets.len(), "stopping tunnels of user over traffic quota");
        let results = join_all(targets.iter().map(|t| self.request_stop(t.id))).await;

        let mut stopped = 0;
        for (tunnel, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => stopped += 1,
                Err(e) => error!(tunnel_id = %tunnel.id, error = %e, "failed to stop tunnel over quota"),
            }
        }
        Ok(stopped)
    }

    // --- reconciliation ---

    async fn mark_unreachable(&self, tunnel: &Tunnel) -> ReconcileAction {
        let reason = "node unreachable";
        if self.current_phase(tunnel) != TunnelPhase::Error {
            if let Err(e) = self.transition(tunnel, TunnelPhase::Error, Some(reason.to_string())) {
                error!(tunnel_id = %tunnel.id, error = %e, "could not mark tunnel errored");
                return ReconcileAction::Failed;
            }
        }
        match self
            .registry
            .record_tunnel_status(tunnel.id, TunnelStatus::Error, Some(reason))
            .await
        {
            Ok(()) => {
                warn!(tunnel_id = %tunnel.id, node_id = %tunnel.node_id, "tunnel marked errored, node unreachable");
                ReconcileAction::MarkedError
            }
            Err(e) => {
                error!(tunnel_id = %tunnel.id, error = %e, "failed to record tunnel status");
                ReconcileAction::Failed
            }
        }
    }

    /// Removes a proxy the node still serves for a tunnel that is already stopped
    async fn remove_stray(&self, tunnel: &Tunnel, seq: u64) -> ReconcileAction {
        let node = match self.load_node(tunnel.node_id).await {
            Ok(node) => node,
            Err(e) => {
                error!(tunnel_id = %tunnel.id, error = %e, "cannot load node for stray proxy");
                return ReconcileAction::Failed;
            }
        };
        let name = tunnel.proxy_name();
        let control = self.control.as_ref();
        let (node_ref, name_ref) = (&node, name.as_str());
        match self
            .with_retries(tunnel.id, seq, "deregister", move || {
                control.deregister_proxy(node_ref, name_ref)
            })
            .await
        {
            Ok(()) => {
                info!(tunnel_id = %tunnel.id, node = %node.name, "removed stray proxy");
                ReconcileAction::Stopped
            }
            Err(CommandFailure::Superseded) => ReconcileAction::Skipped,
            Err(CommandFailure::Failed(e)) => {
                warn!(tunnel_id = %tunnel.id, error = %e, "failed to remove stray proxy");
                ReconcileAction::Failed
            }
        }
    }

    async fn reconcile_tunnel(
        &self,
        tunnel_id: Uuid,
        observation: Option<&NodeObservation>,
        failure_threshold: u32,
    ) -> ReconcileAction {
        let Some(_guard) = self.locks.try_lock(&tunnel_id) else {
            return ReconcileAction::Skipped;
        };
        if self.within_grace(tunnel_id) {
            return ReconcileAction::Skipped;
        }

        let tunnel = match self.registry.get_tunnel(tunnel_id).await {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => return ReconcileAction::Unchanged,
            Err(e) => {
                error!(tunnel_id = %tunnel_id, error = %e, "failed to load tunnel");
                return ReconcileAction::Failed;
            }
        };

        // driven under the latest sequence so a new request still supersedes it
        let seq = self.current_sequence(tunnel_id);
        let node_down = observation.map_or(false, |o| o.consecutive_failures >= failure_threshold);
        let proxy_seen = observation
            .and_then(|o| o.proxies.as_ref())
            .map(|proxies| proxies.contains(&tunnel.proxy_name()));

        if node_down {
            if tunnel.status == TunnelStatus::Running {
                return self.mark_unreachable(&tunnel).await;
            }
            return ReconcileAction::Unchanged;
        }

        match tunnel.desired_status {
            DesiredState::Running => {
                if tunnel.status == TunnelStatus::Running && proxy_seen != Some(false) {
                    return ReconcileAction::Unchanged;
                }
                if self.current_phase(&tunnel) == TunnelPhase::Running {
                    warn!(tunnel_id = %tunnel.id, "proxy missing on node, re-registering");
                    if let Err(e) = self.transition(
                        &tunnel,
                        TunnelPhase::Error,
                        Some("proxy missing on node".to_string()),
                    ) {
                        error!(tunnel_id = %tunnel.id, error = %e, "could not mark tunnel errored");
                        return ReconcileAction::Failed;
                    }
                }
                match self.drive_start(&tunnel, seq).await {
                    Ok(_) => ReconcileAction::Restarted,
                    Err(e) => {
                        warn!(tunnel_id = %tunnel.id, error = %e, "reconcile start failed");
                        ReconcileAction::Failed
                    }
                }
            }
            DesiredState::Stopped => {
                if tunnel.status != TunnelStatus::Stopped
                    || self.current_phase(&tunnel) == TunnelPhase::Running
                {
                    match self.drive_stop(&tunnel, seq).await {
                        Ok(_) => ReconcileAction::Stopped,
                        Err(e) => {
                            warn!(tunnel_id = %tunnel.id, error = %e, "reconcile stop failed");
                            ReconcileAction::Failed
                        }
                    }
                } else if proxy_seen == Some(true) {
                    self.remove_stray(&tunnel, seq).await
                } else {
                    ReconcileAction::Unchanged
                }
            }
        }
    }

    /// Compares every tunnel's desired status with what its node reports and
    /// re-drives the ones that differ
    pub async fn reconcile_once(&self) -> AppResult<ReconcileReport> {
        let tunnels = self.registry.list_all_tunnels().await?;
        let observations = self.monitor.observations().await;
        let threshold = self.monitor.failure_threshold();

        let actions = join_all(
            tunnels
                .iter()
                .map(|t| self.reconcile_tunnel(t.id, observations.get(&t.node_id), threshold)),
        )
        .await;

        let mut report = ReconcileReport {
            examined: actions.len(),
            ..Default::default()
        };
        for action in actions {
            match action {
                ReconcileAction::Unchanged => {}
                ReconcileAction::Skipped => report.skipped += 1,
                ReconcileAction::Restarted => report.restarted += 1,
                ReconcileAction::Stopped => report.stopped += 1,
                ReconcileAction::MarkedError => report.marked_error += 1,
                ReconcileAction::Failed => report.failed += 1,
            }
        }

        self.locks.prune_idle();
        *self.last_pass.write().await = Some(Utc::now());

        if report.changed() {
            info!(?report, "reconcile pass changed tunnels");
        } else {
            debug!(examined = report.examined, skipped = report.skipped, "reconcile pass clean");
        }
        Ok(report)
    }

    /// Periodic reconciliation until `shutdown` changes
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval_secs, "tunnel reconciler started");
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("Shutdown signal received, stopping tunnel reconciler.");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "reconcile pass failed");
                    }
                }
            }
        }
    }

    pub async fn last_pass(&self) -> Option<DateTime<Utc>> {
        *self.last_pass.read().await
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::models::NodeStatus;
    use crate::registry::memory::MemoryRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeControl {
        registered: Mutex<HashSet<String>>,
        down: Mutex<HashSet<Uuid>>,
        register_calls: AtomicUsize,
        deregister_calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeControl {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn take_down(&self, node_id: Uuid) {
            self.down.lock().unwrap().insert(node_id);
        }

        fn bring_up(&self, node_id: Uuid) {
            self.down.lock().unwrap().remove(&node_id);
        }

        fn is_down(&self, node_id: Uuid) -> bool {
            self.down.lock().unwrap().contains(&node_id)
        }

        fn registers(&self) -> usize {
            self.register_calls.load(Ordering::SeqCst)
        }

        fn deregisters(&self) -> usize {
            self.deregister_calls.load(Ordering::SeqCst)
        }

        fn is_registered(&self, name: &str) -> bool {
            self.registered.lock().unwrap().contains(name)
        }
    }

    #[async_trait]
    impl NodeControl for FakeControl {
        async fn register_proxy(&self, node: &Node, proxy: &ProxyConfig) -> Result<(), ControlError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.is_down(node.id) {
                return Err(ControlError::Connection("connection refused".to_string()));
            }
            self.registered.lock().unwrap().insert(proxy.name.clone());
            Ok(())
        }

        async fn deregister_proxy(&self, node: &Node, proxy_name: &str) -> Result<(), ControlError> {
            self.deregister_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.is_down(node.id) {
                return Err(ControlError::Connection("connection refused".to_string()));
            }
            self.registered.lock().unwrap().remove(proxy_name);
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<MemoryRegistry>,
        control: Arc<FakeControl>,
        monitor: Arc<NodeMonitor>,
        ledger: Arc<QuotaLedger>,
        reconciler: Arc<Reconciler>,
    }

    fn reconciler_config() -> ReconcilerConfig {
        ReconcilerConfig {
            interval_secs: 15,
            grace_secs: 0,
            control_timeout_secs: 1,
            retry_attempts: 3,
            retry_base_ms: 1,
        }
    }

    fn harness_with(control: FakeControl, config: ReconcilerConfig) -> Harness {
        let registry = Arc::new(MemoryRegistry::new());
        let ledger = Arc::new(QuotaLedger::new(registry.clone()));
        let monitor_config = MonitorConfig {
            interval_secs: 30,
            timeout_secs: 1,
            failure_threshold: 3,
        };
        let monitor = Arc::new(NodeMonitor::new(registry.clone(), &monitor_config).unwrap());
        let control = Arc::new(control);
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            ledger.clone(),
            monitor.clone(),
            control.clone(),
            config,
        ));
        Harness {
            registry,
            control,
            monitor,
            ledger,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeControl::default(), reconciler_config())
    }

    fn observed(status: NodeStatus, failures: u32, proxies: &[String]) -> NodeObservation {
        NodeObservation {
            status,
            checked_at: Utc::now(),
            consecutive_failures: failures,
            proxies: Some(proxies.iter().cloned().collect()),
        }
    }

    #[test]
    fn test_transition_edges() {
        use TunnelPhase::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Starting));
        assert!(Error.can_transition_to(Stopping));
        assert!(Error.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Running));
    }

    #[tokio::test]
    async fn test_start_twice_sends_one_command() {
        let h = harness();
        let user = h.registry.add_user("alice", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Stopped);

        let first = h.reconciler.request_start(tunnel.id).await.unwrap();
        assert_eq!(first.phase, TunnelPhase::Running);
        assert!(first.changed);

        let second = h.reconciler.request_start(tunnel.id).await.unwrap();
        assert_eq!(second.phase, TunnelPhase::Running);
        assert!(!second.changed);

        assert_eq!(h.control.registers(), 1);
        assert!(h.control.is_registered(&tunnel.proxy_name()));
        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Running);
        assert_eq!(stored.desired_status, DesiredState::Running);
        assert_eq!(h.ledger.pending_slots(user.id), 0);
    }

    #[tokio::test]
    async fn test_fourth_start_exceeds_quota_without_contacting_node() {
        let h = harness();
        let group = h.registry.add_group("three", 3, 1 << 30, false);
        let user = h.registry.add_user("bob", Some(group.id));
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        for i in 0..3 {
            h.registry.add_tunnel(&format!("t{}", i), user.id, node.id, TunnelStatus::Running);
        }
        let fourth = h.registry.add_tunnel("t3", user.id, node.id, TunnelStatus::Stopped);

        let err = h.reconciler.request_start(fourth.id).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        assert_eq!(h.control.registers(), 0);

        let stored = h.registry.tunnel(fourth.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Stopped);
        assert_eq!(stored.desired_status, DesiredState::Stopped);
        let phase = h.reconciler.phase(&stored);
        assert_eq!(phase.phase, TunnelPhase::Stopped);
        assert!(phase.reason.unwrap().starts_with("quota exceeded"));
        assert_eq!(h.ledger.usage(user.id).await.unwrap().running_tunnels, 3);
    }

    #[tokio::test]
    async fn test_quota_denied_tunnel_needs_no_node_commands() {
        let h = harness();
        let group = h.registry.add_group("none", 0, 1 << 30, false);
        let user = h.registry.add_user("quinn", Some(group.id));
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let first = h.registry.add_tunnel("a", user.id, node.id, TunnelStatus::Stopped);
        let second = h.registry.add_tunnel("b", user.id, node.id, TunnelStatus::Stopped);

        let err = h.reconciler.request_start(first.id).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        let stop = h.reconciler.request_stop(first.id).await.unwrap();
        assert_eq!(stop.phase, TunnelPhase::Stopped);
        assert!(!stop.changed);
        assert_eq!(h.control.deregisters(), 0);

        let err = h.reconciler.request_start(second.id).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        h.control.take_down(node.id);
        h.reconciler.delete(second.id).await.unwrap();
        assert!(h.registry.tunnel(second.id).is_none());

        assert_eq!(h.control.registers() + h.control.deregisters(), 0);
        assert_eq!(h.registry.tunnel(first.id).unwrap().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_node_during_start_releases_reservation() {
        let h = harness();
        let group = h.registry.add_group("one", 1, 1 << 30, false);
        let user = h.registry.add_user("carol", Some(group.id));
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("web", user.id, node.id, TunnelStatus::Stopped);
        h.control.take_down(node.id);

        let err = h.reconciler.request_start(tunnel.id).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
        assert_eq!(h.control.registers(), 3);

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Error);
        assert!(stored.last_error.is_some());
        assert_eq!(h.ledger.pending_slots(user.id), 0);
        assert_eq!(h.ledger.usage(user.id).await.unwrap().running_tunnels, 0);

        // the slot is free again once the node recovers
        h.control.bring_up(node.id);
        let outcome = h.reconciler.request_start(tunnel.id).await.unwrap();
        assert_eq!(outcome.phase, TunnelPhase::Running);
    }

    #[tokio::test]
    async fn test_stop_retries_then_keeps_prior_status() {
        let h = harness();
        let user = h.registry.add_user("dave", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("db", user.id, node.id, TunnelStatus::Running);
        h.control.take_down(node.id);

        let err = h.reconciler.request_stop(tunnel.id).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
        assert_eq!(h.control.deregisters(), 3);

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Running);
        assert_eq!(stored.desired_status, DesiredState::Stopped);
        assert!(stored.last_error.is_some());
        assert_eq!(h.reconciler.phase(&stored).phase, TunnelPhase::Error);

        // the reconcile loop finishes the stop once the node is back
        h.control.bring_up(node.id);
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert_eq!(h.registry.tunnel(tunnel.id).unwrap().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_batch_stop_reports_per_item_outcomes() {
        let h = harness();
        let user = h.registry.add_user("erin", None);
        let healthy = h.registry.add_node("a", "127.0.0.1", None);
        let broken = h.registry.add_node("b", "127.0.0.1", None);
        let tunnels: Vec<Tunnel> = (0..5)
            .map(|i| {
                let node = if i == 2 { broken.id } else { healthy.id };
                h.registry
                    .add_tunnel(&format!("t{}", i), user.id, node, TunnelStatus::Running)
            })
            .collect();
        h.control.take_down(broken.id);

        let ids = tunnels.iter().map(|t| t.id).collect();
        let outcome = h.reconciler.batch(ids, BatchOperation::Stop, None).await;

        assert_eq!(outcome.success_count, 4);
        assert_eq!(outcome.failure_count, 1);
        let failed: Vec<_> = outcome.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed[0].tunnel_id, tunnels[2].id);
        assert_eq!(failed[0].error_code, Some("TRANSIENT_NETWORK_FAILURE"));

        for (i, tunnel) in tunnels.iter().enumerate() {
            let stored = h.registry.tunnel(tunnel.id).unwrap();
            if i == 2 {
                assert_eq!(stored.status, TunnelStatus::Running);
            } else {
                assert_eq!(stored.status, TunnelStatus::Stopped);
            }
        }
    }

    #[tokio::test]
    async fn test_batch_hides_foreign_tunnels_and_dedupes() {
        let h = harness();
        let owner = h.registry.add_user("owner", None);
        let other = h.registry.add_user("other", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let mine = h.registry.add_tunnel("mine", owner.id, node.id, TunnelStatus::Stopped);
        let theirs = h.registry.add_tunnel("theirs", other.id, node.id, TunnelStatus::Stopped);

        let outcome = h
            .reconciler
            .batch(vec![mine.id, mine.id, theirs.id], BatchOperation::Start, Some(owner.id))
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.results[1].error_code, Some("NOT_FOUND"));
        assert_eq!(h.registry.tunnel(theirs.id).unwrap().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_later_stop_wins_over_earlier_start() {
        let h = harness_with(
            FakeControl::with_delay(Duration::from_millis(50)),
            reconciler_config(),
        );
        let user = h.registry.add_user("frank", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("api", user.id, node.id, TunnelStatus::Stopped);

        let (_start, stop) = tokio::join!(
            h.reconciler.request_start(tunnel.id),
            h.reconciler.request_stop(tunnel.id)
        );
        assert!(stop.is_ok());

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Stopped);
        assert_eq!(stored.desired_status, DesiredState::Stopped);
        assert!(!h.control.is_registered(&tunnel.proxy_name()));
    }

    #[tokio::test]
    async fn test_later_start_wins_over_earlier_stop() {
        let h = harness_with(
            FakeControl::with_delay(Duration::from_millis(50)),
            reconciler_config(),
        );
        let user = h.registry.add_user("gina", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("api", user.id, node.id, TunnelStatus::Running);

        let (_stop, start) = tokio::join!(
            h.reconciler.request_stop(tunnel.id),
            h.reconciler.request_start(tunnel.id)
        );
        assert!(start.is_ok());

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Running);
        assert_eq!(stored.desired_status, DesiredState::Running);
        assert!(h.control.is_registered(&tunnel.proxy_name()));
    }

    #[tokio::test]
    async fn test_newer_request_cancels_retry_loop() {
        let mut config = reconciler_config();
        config.retry_base_ms = 100;
        let h = harness_with(FakeControl::default(), config);
        let user = h.registry.add_user("hank", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("api", user.id, node.id, TunnelStatus::Stopped);
        h.control.take_down(node.id);

        let start = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move { reconciler.request_start(tunnel.id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.control.bring_up(node.id);
        let stop = h.reconciler.request_stop(tunnel.id).await;

        let start = start.await.unwrap();
        assert!(matches!(start, Err(AppError::Conflict(_))));
        assert_eq!(h.control.registers(), 1);
        assert!(stop.is_ok());

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Stopped);
        assert_eq!(stored.desired_status, DesiredState::Stopped);
    }

    #[tokio::test]
    async fn test_reconcile_reregisters_missing_proxy() {
        let h = harness();
        let user = h.registry.add_user("ivy", None);
        let node = h.registry.add_node("edge", "127.0.0.1", Some(7500));
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Running);
        h.monitor
            .observe(node.id, observed(NodeStatus::Online, 0, &[]))
            .await;

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.restarted, 1);
        assert_eq!(h.control.registers(), 1);
        assert!(h.control.is_registered(&tunnel.proxy_name()));
        assert_eq!(h.registry.tunnel(tunnel.id).unwrap().status, TunnelStatus::Running);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_matching_tunnels_alone() {
        let h = harness();
        let user = h.registry.add_user("jack", None);
        let node = h.registry.add_node("edge", "127.0.0.1", Some(7500));
        let running = h.registry.add_tunnel("up", user.id, node.id, TunnelStatus::Running);
        h.registry.add_tunnel("down", user.id, node.id, TunnelStatus::Stopped);
        h.monitor
            .observe(node.id, observed(NodeStatus::Online, 0, &[running.proxy_name()]))
            .await;

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.examined, 2);
        assert!(!report.changed());
        assert_eq!(h.control.registers() + h.control.deregisters(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_marks_tunnels_on_unreachable_node() {
        let h = harness();
        let user = h.registry.add_user("kate", None);
        let node = h.registry.add_node("edge", "127.0.0.1", Some(7500));
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Running);
        h.monitor
            .observe(
                node.id,
                NodeObservation {
                    status: NodeStatus::Offline,
                    checked_at: Utc::now(),
                    consecutive_failures: 3,
                    proxies: None,
                },
            )
            .await;

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.marked_error, 1);
        assert_eq!(h.control.registers(), 0);

        let stored = h.registry.tunnel(tunnel.id).unwrap();
        assert_eq!(stored.status, TunnelStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("node unreachable"));
        assert_eq!(stored.desired_status, DesiredState::Running);

        // once the node answers again the tunnel is restarted
        h.monitor
            .observe(node.id, observed(NodeStatus::Online, 0, &[]))
            .await;
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.restarted, 1);
        assert_eq!(h.registry.tunnel(tunnel.id).unwrap().status, TunnelStatus::Running);
    }

    #[tokio::test]
    async fn test_reconcile_removes_stray_proxy() {
        let h = harness();
        let user = h.registry.add_user("liam", None);
        let node = h.registry.add_node("edge", "127.0.0.1", Some(7500));
        let tunnel = h.registry.add_tunnel("old", user.id, node.id, TunnelStatus::Stopped);
        h.monitor
            .observe(node.id, observed(NodeStatus::Online, 0, &[tunnel.proxy_name()]))
            .await;

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert_eq!(h.control.deregisters(), 1);
        assert_eq!(h.registry.tunnel(tunnel.id).unwrap().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reconcile_skips_recent_transitions() {
        let mut config = reconciler_config();
        config.grace_secs = 60;
        let h = harness_with(FakeControl::default(), config);
        let user = h.registry.add_user("mia", None);
        let node = h.registry.add_node("edge", "127.0.0.1", Some(7500));
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Stopped);

        h.reconciler.request_start(tunnel.id).await.unwrap();
        h.monitor
            .observe(node.id, observed(NodeStatus::Online, 0, &[]))
            .await;

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.control.registers(), 1);
    }

    #[tokio::test]
    async fn test_delete_deregisters_running_tunnel() {
        let h = harness();
        let user = h.registry.add_user("noah", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Running);

        let deleted = h.reconciler.delete(tunnel.id).await.unwrap();
        assert_eq!(deleted.id, tunnel.id);
        assert_eq!(h.control.deregisters(), 1);
        assert!(h.registry.tunnel(tunnel.id).is_none());

        let err = h.reconciler.delete(tunnel.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_keeps_tunnel_when_stop_fails() {
        let h = harness();
        let user = h.registry.add_user("olga", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Running);
        h.control.take_down(node.id);

        assert!(h.reconciler.delete(tunnel.id).await.is_err());
        assert!(h.registry.tunnel(tunnel.id).is_some());
    }

    #[tokio::test]
    async fn test_force_delete_clears_tunnel_on_dead_node() {
        let h = harness();
        let user = h.registry.add_user("rosa", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Stopped);
        h.control.take_down(node.id);

        let err = h.reconciler.request_start(tunnel.id).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
        assert_eq!(h.registry.tunnel(tunnel.id).unwrap().status, TunnelStatus::Error);

        let err = h.reconciler.delete(tunnel.id).await.unwrap_err();
        assert!(matches!(err, AppError::TransientNetwork(_)));
        assert!(h.registry.tunnel(tunnel.id).is_some());

        let deleted = h.reconciler.force_delete(tunnel.id).await.unwrap();
        assert_eq!(deleted.id, tunnel.id);
        assert!(h.registry.tunnel(tunnel.id).is_none());
        assert!(h.registry.list_user_tunnels(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_refused_until_stopped() {
        let h = harness();
        let user = h.registry.add_user("pia", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let tunnel = h.registry.add_tunnel("ssh", user.id, node.id, TunnelStatus::Stopped);

        h.reconciler.request_start(tunnel.id).await.unwrap();
        let err = h
            .reconciler
            .edit_stopped(tunnel.id, |t| async move { Ok(t.name) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        h.reconciler.request_stop(tunnel.id).await.unwrap();
        let name = h
            .reconciler
            .edit_stopped(tunnel.id, |t| async move { Ok(t.name) })
            .await
            .unwrap();
        assert_eq!(name, "ssh");
    }

    #[tokio::test]
    async fn test_enforce_traffic_quota_stops_running_tunnels() {
        let h = harness();
        let user = h.registry.add_user("pete", None);
        let node = h.registry.add_node("edge", "127.0.0.1", None);
        let a = h.registry.add_tunnel("a", user.id, node.id, TunnelStatus::Running);
        let b = h.registry.add_tunnel("b", user.id, node.id, TunnelStatus::Running);
        h.registry.add_tunnel("c", user.id, node.id, TunnelStatus::Stopped);

        assert_eq!(h.reconciler.enforce_traffic_quota(user.id).await.unwrap(), 2);
        for id in [a.id, b.id] {
            let stored = h.registry.tunnel(id).unwrap();
            assert_eq!(stored.status, TunnelStatus::Stopped);
            assert_eq!(stored.desired_status, DesiredState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.reconciler.clone().run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(h.reconciler.interval() > Duration::ZERO);
    }
}
