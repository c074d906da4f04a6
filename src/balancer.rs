//! Node selection for routing fabric traffic.
//!
//! Chooses delivery targets among serving nodes, weighing reported load
//! and observed latency.

use crate::error::{FabricError, Result};
use crate::registry::NodeRegistry;
use crate::types::{NodeId, NodeInfo};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Strategy for picking a delivery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Rotate through serving nodes.
    RoundRobin,
    /// Pick the node with the lowest reported load factor.
    LeastLoaded,
    /// Pick the node with the lowest average response time.
    LowestLatency,
}

/// Balancer over the shared node registry.
pub struct NodeBalancer {
    registry: Arc<NodeRegistry>,
    strategy: SelectionStrategy,
    /// Load factor above which a node is skipped unless nothing else serves.
    overload_threshold: f64,
    round_robin_counter: AtomicU64,
}

impl NodeBalancer {
    pub fn new(registry: Arc<NodeRegistry>, strategy: SelectionStrategy) -> Self {
        Self {
            registry,
            strategy,
            overload_threshold: 0.9,
            round_robin_counter: AtomicU64::new(0),
        }
    }

    /// Pick a delivery target, skipping excluded nodes.
    pub fn select(&self, exclude: &HashSet<NodeId>) -> Result<NodeInfo> {
        let mut candidates: Vec<NodeInfo> = self
            .registry
            .active_nodes()
            .into_iter()
            .filter(|n| !exclude.contains(&n.id))
            .collect();

        if candidates.is_empty() {
            return Err(FabricError::NoEligibleNode);
        }

        // Prefer nodes under the overload threshold; fall back to the
        // full candidate set when everything is saturated.
        let relaxed: Vec<NodeInfo> = candidates
            .iter()
            .filter(|n| n.health.load_factor < self.overload_threshold)
            .cloned()
            .collect();
        if !relaxed.is_empty() {
            candidates = relaxed;
        }

        // Deterministic tie-breaking across processes.
        candidates.sort_by_key(|n| n.id);

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize
                    % candidates.len();
                candidates.swap_remove(idx)
            }
            SelectionStrategy::LeastLoaded => {
                // Ties on load break toward the faster responder.
                candidates
                    .into_iter()
                    .min_by(|a, b| {
                        a.health
                            .load_factor
                            .partial_cmp(&b.health.load_factor)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.health.avg_response_us.cmp(&b.health.avg_response_us))
                    })
                    .ok_or(FabricError::NoEligibleNode)?
            }
            SelectionStrategy::LowestLatency => {
                candidates
                    .into_iter()
                    .min_by_key(|n| n.health.avg_response_us)
                    .ok_or(FabricError::NoEligibleNode)?
            }
        };

        debug!(node_id = chosen.id, strategy = ?self.strategy, "Selected delivery target");
        Ok(chosen)
    }

    /// Pick up to `count` distinct targets for fan-out delivery.
    pub fn select_many(&self, count: usize, exclude: &HashSet<NodeId>) -> Result<Vec<NodeInfo>> {
        let mut exclude = exclude.clone();
        let mut picked = Vec::with_capacity(count);

        for _ in 0..count {
            match self.select(&exclude) {
                Ok(node) => {
                    exclude.insert(node.id);
                    picked.push(node);
                }
                Err(FabricError::NoEligibleNode) => break,
                Err(e) => return Err(e),
            }
        }

        if picked.is_empty() {
            return Err(FabricError::NoEligibleNode);
        }
        Ok(picked)
    }

    /// Spread of load across serving nodes, 0-100 where higher means
    /// more even.
    pub fn balance_score(&self) -> f64 {
        let loads: Vec<f64> = self
            .registry
            .active_nodes()
            .iter()
            .map(|n| n.health.load_factor * 100.0)
            .collect();

        if loads.is_empty() {
            return 100.0;
        }

        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let variance =
            loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;
        let std_dev = variance.sqrt();

        (100.0 - std_dev).clamp(0.0, 100.0)
    }
}
