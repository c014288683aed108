//! Offload coordinator
//!
//! Mirrors the center's load-balancing state and issues offload commands.
//!
//! The status cache is replaced wholesale by every successful poll; a poll
//! that fails leaves the previous cache in place. Commands are validated
//! locally first and never reach the network when the selection is invalid.
//! Successful starts are remembered as pending intents until the next poll,
//! which is authoritative.

mod balancer;

pub use balancer::{AutoBalancer, BalanceAction, BalancerPolicy};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{Edge, EdgeId};

/// Load-balancing state as reported by the center
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadStatus {
    /// source -> target
    #[serde(default)]
    pub active_offloads: BTreeMap<EdgeId, EdgeId>,
    #[serde(default)]
    pub overloaded_edges: BTreeSet<EdgeId>,
    /// Edges the center has metrics for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_count: Option<usize>,
}

impl OffloadStatus {
    pub fn target_of(&self, source: &EdgeId) -> Option<&EdgeId> {
        self.active_offloads.get(source)
    }

    pub fn is_overloaded(&self, edge: &EdgeId) -> bool {
        self.overloaded_edges.contains(edge)
    }
}

/// Center-side balancer API
#[async_trait::async_trait]
pub trait CenterApi: Send + Sync {
    async fn list_edges(&self) -> Result<Vec<Edge>>;

    async fn offload_status(&self) -> Result<OffloadStatus>;

    async fn start_offload(&self, source: &EdgeId, target: &EdgeId) -> Result<()>;

    async fn stop_offload(&self, source: &EdgeId) -> Result<()>;
}

/// Rejected offload command
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// Source or target not selected
    #[error("select both source and target edges")]
    MissingSelection,
    #[error("edge {0} cannot offload to itself")]
    SelfOffload(EdgeId),
    #[error("unknown edge {0}")]
    UnknownEdge(EdgeId),
    #[error("edge {0} is offline")]
    EdgeOffline(EdgeId),
    /// The source already offloads elsewhere; use `retarget_offload` to move it
    #[error("edge {edge} already offloads to {current}")]
    SourceBusy { edge: EdgeId, current: EdgeId },
    /// The source is itself the target of another offload
    #[error("edge {edge} is taking work from {from}")]
    SourceIsTarget { edge: EdgeId, from: EdgeId },
    /// The target is itself offloading elsewhere
    #[error("edge {edge} is offloading to {to}")]
    TargetIsSource { edge: EdgeId, to: EdgeId },
    /// The command was sent and failed
    #[error("offload command failed: {0:#}")]
    Remote(#[source] anyhow::Error),
}

impl OffloadError {
    /// True for errors raised before anything was sent
    pub fn is_validation(&self) -> bool {
        !matches!(self, OffloadError::Remote(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The same pair is already active or pending; nothing was sent
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// No offload from that edge; nothing was sent
    NotActive,
}

/// Owns the offload status cache, the edge listing and pending intents
pub struct OffloadCoordinator {
    api: Arc<dyn CenterApi>,
    edges: watch::Sender<Vec<Edge>>,
    status: watch::Sender<OffloadStatus>,
    /// Starts issued since the last successful poll
    pending: Mutex<BTreeMap<EdgeId, EdgeId>>,
    /// Set by a successful status poll, cleared by a failed one
    status_fresh: AtomicBool,
    /// Serializes commands and status polls against each other
    commands: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl OffloadCoordinator {
    pub fn new(api: Arc<dyn CenterApi>) -> Self {
        Self {
            api,
            edges: watch::Sender::new(Vec::new()),
            status: watch::Sender::new(OffloadStatus::default()),
            pending: Mutex::new(BTreeMap::new()),
            status_fresh: AtomicBool::new(false),
            commands: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<EdgeId, EdgeId>> {
        // A poisoned map is still a valid map
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest confirmed status
    pub fn status(&self) -> OffloadStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OffloadStatus> {
        self.status.subscribe()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.edges.borrow().clone()
    }

    pub fn subscribe_edges(&self) -> watch::Receiver<Vec<Edge>> {
        self.edges.subscribe()
    }

    /// Starts sent since the last poll
    pub fn pending_intents(&self) -> BTreeMap<EdgeId, EdgeId> {
        self.pending().clone()
    }

    /// Confirmed offloads overlaid with pending intents
    pub fn effective_offloads(&self) -> BTreeMap<EdgeId, EdgeId> {
        let mut offloads = self.status.borrow().active_offloads.clone();
        offloads.extend(self.pending().iter().map(|(s, t)| (s.clone(), t.clone())));
        offloads
    }

    /// Edges that may be picked as a source: every online edge
    pub fn eligible_sources(&self) -> Vec<EdgeId> {
        self.edges
            .borrow()
            .iter()
            .filter(|e| e.is_online())
            .map(|e| e.id.clone())
            .collect()
    }

    /// Online edges the center flags as overloaded. Advisory only.
    pub fn overloaded_sources(&self) -> Vec<EdgeId> {
        let status = self.status.borrow();
        self.edges
            .borrow()
            .iter()
            .filter(|e| e.is_online() && status.is_overloaded(&e.id))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Refresh the edge listing. The cache is kept on failure.
    pub async fn refresh_edges(&self) -> Result<()> {
        let edges = self.api.list_edges().await?;
        debug!(count = edges.len(), "Edge listing refreshed");
        self.edges.send_replace(edges);
        Ok(())
    }

    /// Refresh the offload status and drop pending intents.
    ///
    /// The cache is kept on failure.
    pub async fn refresh_status(&self) -> Result<()> {
        let _guard = self.commands.lock().await;
        let status = match self.api.offload_status().await {
            Ok(status) => status,
            Err(e) => {
                self.status_fresh.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let pending = std::mem::take(&mut *self.pending());
        for (source, target) in &pending {
            if status.target_of(source) != Some(target) {
                info!(
                    source = %source,
                    target = %target,
                    "Offload intent not confirmed by center"
                );
            }
        }
        debug!(active = status.active_offloads.len(), "Offload status refreshed");
        self.status.send_replace(status);
        self.status_fresh.store(true, Ordering::Release);
        Ok(())
    }

    /// Refresh both caches, logging failures
    pub async fn refresh(&self) {
        if let Err(e) = self.refresh_edges().await {
            warn!(error = %format!("{e:#}"), "Failed to fetch edges, keeping previous listing");
        }
        if let Err(e) = self.refresh_status().await {
            warn!(error = %format!("{e:#}"), "Failed to fetch offload status, keeping previous status");
        }
    }

    fn validate(&self, source: &EdgeId, target: &EdgeId) -> Result<(), OffloadError> {
        if source.is_empty() || target.is_empty() {
            return Err(OffloadError::MissingSelection);
        }
        if source == target {
            return Err(OffloadError::SelfOffload(source.clone()));
        }
        let edges = self.edges.borrow();
        for id in [source, target] {
            match edges.iter().find(|e| &e.id == id) {
                None => return Err(OffloadError::UnknownEdge(id.clone())),
                Some(edge) if !edge.is_online() => return Err(OffloadError::EdgeOffline(id.clone())),
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Start offloading `source` to `target`.
    ///
    /// A source that already offloads to another target is rejected with
    /// [`OffloadError::SourceBusy`].
    pub async fn start_offload(
        &self,
        source: &EdgeId,
        target: &EdgeId,
    ) -> Result<StartOutcome, OffloadError> {
        self.start(source, target, false).await
    }

    /// Like [`start_offload`](Self::start_offload), but moves an existing
    /// offload of `source` to `target`.
    pub async fn retarget_offload(
        &self,
        source: &EdgeId,
        target: &EdgeId,
    ) -> Result<StartOutcome, OffloadError> {
        self.start(source, target, true).await
    }

    async fn start(
        &self,
        source: &EdgeId,
        target: &EdgeId,
        retarget: bool,
    ) -> Result<StartOutcome, OffloadError> {
        self.validate(source, target)?;

        let _guard = self.commands.lock().await;
        let offloads = self.effective_offloads();
        match offloads.get(source) {
            Some(current) if current == target => {
                debug!(source = %source, target = %target, "Offload already active");
                return Ok(StartOutcome::AlreadyActive);
            }
            Some(current) if !retarget => {
                return Err(OffloadError::SourceBusy {
                    edge: source.clone(),
                    current: current.clone(),
                });
            }
            Some(current) => {
                info!(source = %source, from = %current, to = %target, "Retargeting offload");
            }
            None => {}
        }
        // No chains: a source may not be a target and vice versa
        if let Some((from, _)) = offloads.iter().find(|(_, t)| *t == source) {
            return Err(OffloadError::SourceIsTarget {
                edge: source.clone(),
                from: from.clone(),
            });
        }
        if let Some(to) = offloads.get(target) {
            return Err(OffloadError::TargetIsSource {
                edge: target.clone(),
                to: to.clone(),
            });
        }

        self.api
            .start_offload(source, target)
            .await
            .map_err(OffloadError::Remote)?;
        info!(source = %source, target = %target, "Offload started");
        self.pending().insert(source.clone(), target.clone());
        Ok(StartOutcome::Started)
    }

    /// Stop any offload where `source` is the source.
    ///
    /// Nothing is sent when the status cache is current and knows no
    /// offload from `source`. Without a current cache the stop is sent
    /// anyway; the center treats it as idempotent.
    pub async fn stop_offload(&self, source: &EdgeId) -> Result<StopOutcome, OffloadError> {
        if source.is_empty() {
            return Err(OffloadError::MissingSelection);
        }

        let _guard = self.commands.lock().await;
        if !self.effective_offloads().contains_key(source) {
            if self.status_fresh.load(Ordering::Acquire) {
                debug!(source = %source, "No offload to stop");
                return Ok(StopOutcome::NotActive);
            }
            debug!(source = %source, "Offload status unknown, sending stop anyway");
        }

        self.api
            .stop_offload(source)
            .await
            .map_err(OffloadError::Remote)?;
        self.pending().remove(source);
        self.status.send_if_modified(|status| status.active_offloads.remove(source).is_some());
        info!(source = %source, "Offload stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Plan against the cached listing and execute the plan.
    ///
    /// Returns the actions that were carried out.
    pub async fn auto_balance(&self, balancer: &AutoBalancer) -> Vec<BalanceAction> {
        let plan = balancer.plan(&self.edges(), &self.effective_offloads());
        let mut done = Vec::with_capacity(plan.len());
        for action in plan {
            let result = match &action {
                BalanceAction::Start { source, target } => self
                    .start_offload(source, target)
                    .await
                    .map(|outcome| outcome == StartOutcome::Started),
                BalanceAction::Stop { source } => self
                    .stop_offload(source)
                    .await
                    .map(|outcome| outcome == StopOutcome::Stopped),
            };
            match result {
                Ok(true) => {
                    info!(%action, "Auto-balance");
                    done.push(action);
                }
                Ok(false) => {}
                Err(e) => warn!(%action, error = %e, "Auto-balance action failed"),
            }
        }
        done
    }

    /// Poll the center every `interval` until closed, optionally running
    /// the auto-balancer after each poll.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration, balancer: Option<AutoBalancer>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.refresh().await;
                        if let Some(balancer) = &balancer {
                            this.auto_balance(balancer).await;
                        }
                    }
                }
            }
            debug!("Offload polling stopped");
        });
    }

    /// Stop polling. Idempotent; caches stay readable.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for OffloadCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
