//! Automatic offload planning
//!
//! Pure function of the edge listing and the current offloads; the
//! coordinator executes the resulting actions through its normal start/stop
//! path so validation and intent tracking apply unchanged.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Edge, EdgeId, Metrics, CPU_WARN_THRESHOLD, GPU_WARN_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancerPolicy {
    /// GPU usage above which an edge is overloaded (percent)
    pub gpu_threshold: f32,
    /// CPU usage above which an edge is overloaded (percent)
    pub cpu_threshold: f32,
    /// A target's GPU must be below this fraction of `gpu_threshold`
    pub target_headroom: f32,
    /// An offload is released once GPU and CPU are both below this
    /// fraction of their thresholds
    pub release_ratio: f32,
}

impl Default for BalancerPolicy {
    fn default() -> Self {
        Self {
            gpu_threshold: GPU_WARN_THRESHOLD,
            cpu_threshold: CPU_WARN_THRESHOLD,
            target_headroom: 0.6,
            release_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceAction {
    Start { source: EdgeId, target: EdgeId },
    Stop { source: EdgeId },
}

impl fmt::Display for BalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceAction::Start { source, target } => write!(f, "start {source} -> {target}"),
            BalanceAction::Stop { source } => write!(f, "stop {source}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoBalancer {
    policy: BalancerPolicy,
}

impl AutoBalancer {
    pub fn new(policy: BalancerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BalancerPolicy {
        &self.policy
    }

    /// Missing readings count as idle
    pub fn is_overloaded(&self, metrics: &Metrics) -> bool {
        metrics.gpu_usage.unwrap_or(0.0) > self.policy.gpu_threshold
            || metrics.cpu_usage.unwrap_or(0.0) > self.policy.cpu_threshold
    }

    fn can_release(&self, metrics: &Metrics) -> bool {
        let ratio = self.policy.release_ratio;
        metrics.gpu_usage.unwrap_or(0.0) < self.policy.gpu_threshold * ratio
            && metrics.cpu_usage.unwrap_or(0.0) < self.policy.cpu_threshold * ratio
    }

    /// GPU usage if the edge can take work; an unknown GPU never can
    fn spare_gpu(&self, edge: &Edge) -> Option<f32> {
        let metrics = edge.metrics.as_ref()?;
        let gpu = metrics.gpu_usage?;
        let limit = self.policy.gpu_threshold * self.policy.target_headroom;
        (edge.is_online() && gpu < limit && !self.is_overloaded(metrics)).then_some(gpu)
    }

    /// Best target for `source`. Edges that offload themselves are skipped.
    fn least_loaded(
        &self,
        edges: &[Edge],
        source: &EdgeId,
        offloads: &BTreeMap<EdgeId, EdgeId>,
    ) -> Option<EdgeId> {
        edges
            .iter()
            .filter(|e| &e.id != source && !offloads.contains_key(&e.id))
            .filter_map(|e| self.spare_gpu(e).map(|gpu| (gpu, &e.id)))
            .min_by(|(a, a_id), (b, b_id)| a.total_cmp(b).then_with(|| a_id.cmp(b_id)))
            .map(|(_, id)| id.clone())
    }

    /// Actions that bring `offloads` in line with current metrics.
    ///
    /// Edges are visited in listing order. Offline edges and edges without
    /// metrics are left alone, and no edge is made both a source and a
    /// target.
    pub fn plan(&self, edges: &[Edge], offloads: &BTreeMap<EdgeId, EdgeId>) -> Vec<BalanceAction> {
        let mut actions = Vec::new();
        for edge in edges.iter().filter(|e| e.is_online()) {
            let Some(metrics) = edge.metrics.as_ref() else {
                continue;
            };
            let offloading = offloads.contains_key(&edge.id);
            let receiving = offloads.values().any(|target| target == &edge.id);

            if self.is_overloaded(metrics) {
                if offloading || receiving {
                    continue;
                }
                if let Some(target) = self.least_loaded(edges, &edge.id, offloads) {
                    actions.push(BalanceAction::Start {
                        source: edge.id.clone(),
                        target,
                    });
                }
            } else if offloading && self.can_release(metrics) {
                actions.push(BalanceAction::Stop {
                    source: edge.id.clone(),
                });
            }
        }
        actions
    }
}
