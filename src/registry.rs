//! Cluster node registry and the membership state machine.
//!
//! The registry is the authoritative local view of cluster membership.
//! It is mutated in two ways: through committed ConfigChange entries
//! applied by the consensus engine, and through health observations
//! reported by the failure detector and transport.

use crate::error::{FabricError, Result};
use crate::raft::{EntryKind, MembershipChange, MembershipChangeType, StateMachine};
use crate::types::{
    NodeId, NodeInfo, NodeLifecycle, NodeRole, MAX_CLUSTER_NODES, MAX_ENDPOINTS_PER_NODE,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thread-safe registry of cluster members.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node. Fails if the cluster is full, the ID is
    /// taken, or the node advertises too many endpoints.
    pub fn register(&self, node: NodeInfo) -> Result<()> {
        if node.endpoints.len() > MAX_ENDPOINTS_PER_NODE {
            return Err(FabricError::InvalidArgument(format!(
                "Node {} advertises {} endpoints, maximum is {}",
                node.id,
                node.endpoints.len(),
                MAX_ENDPOINTS_PER_NODE
            )));
        }

        let mut nodes = self.nodes.write();
        if nodes.len() >= MAX_CLUSTER_NODES {
            return Err(FabricError::ClusterFull(MAX_CLUSTER_NODES));
        }
        if nodes.contains_key(&node.id) {
            return Err(FabricError::NodeExists(node.id));
        }

        info!(node_id = node.id, name = %node.name, role = ?node.role, "Registered node");
        nodes.insert(node.id, node);
        Ok(())
    }

    /// Remove a node, returning its final record.
    pub fn remove(&self, node_id: NodeId) -> Result<NodeInfo> {
        self.nodes
            .write()
            .remove(&node_id)
            .ok_or(FabricError::NodeNotFound(node_id))
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    /// Nodes in a serving lifecycle state.
    pub fn active_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.is_active())
            .cloned()
            .collect()
    }

    /// Nodes counting toward election quorum.
    pub fn voting_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.is_voting())
            .cloned()
            .collect()
    }

    /// Move a node through its lifecycle, enforcing legal transitions.
    pub fn set_lifecycle(&self, node_id: NodeId, next: NodeLifecycle) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&node_id)
            .ok_or(FabricError::NodeNotFound(node_id))?;

        if node.lifecycle == next {
            return Ok(());
        }
        if !node.lifecycle.can_transition_to(next) {
            return Err(FabricError::InvalidArgument(format!(
                "Illegal lifecycle transition {:?} -> {:?} for node {}",
                node.lifecycle, next, node_id
            )));
        }

        debug!(node_id, from = ?node.lifecycle, to = ?next, "Lifecycle transition");
        node.lifecycle = next;
        Ok(())
    }

    /// Update a node's consensus role, keeping the voting flag coherent.
    pub fn set_role(&self, node_id: NodeId, role: NodeRole) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&node_id)
            .ok_or(FabricError::NodeNotFound(node_id))?;
        node.role = role;
        node.voting = role.is_voting();
        Ok(())
    }

    /// Record a successful contact: refresh last_contact and clear the
    /// failure streak.
    pub fn record_heartbeat(&self, node_id: NodeId) {
        if let Some(node) = self.nodes.write().get_mut(&node_id) {
            node.health.last_contact = Utc::now();
            node.health.consecutive_failures = 0;
        }
    }

    /// Record a failed contact attempt, returning the streak length.
    pub fn record_failure(&self, node_id: NodeId) -> u32 {
        match self.nodes.write().get_mut(&node_id) {
            Some(node) => {
                node.health.consecutive_failures += 1;
                node.health.consecutive_failures
            }
            None => 0,
        }
    }

    /// Fold in a node's self-reported health metrics.
    pub fn update_health(&self, node_id: NodeId, load_factor: f64, avg_response_us: u64) {
        if let Some(node) = self.nodes.write().get_mut(&node_id) {
            node.health.load_factor = load_factor.clamp(0.0, 1.0);
            node.health.avg_response_us = avg_response_us;
            node.health.last_contact = Utc::now();
        }
    }

    /// Account a processed message against a node's counters.
    pub fn record_message(&self, node_id: NodeId, bytes: u64) {
        if let Some(node) = self.nodes.write().get_mut(&node_id) {
            node.health.messages_processed += 1;
            node.health.bytes_processed += bytes;
        }
    }
}

/// The consensus state machine: committed membership changes applied to
/// a shared [`NodeRegistry`].
pub struct MembershipStateMachine {
    registry: Arc<NodeRegistry>,
}

impl MembershipStateMachine {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    fn apply_change(&self, change: MembershipChange) {
        match change.change_type {
            MembershipChangeType::AddNode | MembershipChangeType::AddLearner => {
                let name = change
                    .node_name
                    .unwrap_or_else(|| format!("node-{}", change.node_id));
                let mut node = if change.change_type == MembershipChangeType::AddNode {
                    NodeInfo::new(change.node_id, name)
                } else {
                    NodeInfo::new_learner(change.node_id, name)
                };
                node.endpoints = change.endpoints;
                // Commitment of the config change completes the join.
                node.lifecycle = NodeLifecycle::Active;

                if let Err(e) = self.registry.register(node) {
                    warn!(node_id = change.node_id, error = %e, "Membership add not applied");
                }
            }
            MembershipChangeType::PromoteLearner => {
                if let Err(e) = self.registry.set_role(change.node_id, NodeRole::Follower) {
                    warn!(node_id = change.node_id, error = %e, "Learner promotion not applied");
                }
            }
            MembershipChangeType::RemoveNode => {
                match self.registry.remove(change.node_id) {
                    Ok(node) => {
                        info!(node_id = node.id, name = %node.name, "Node removed from membership");
                    }
                    Err(e) => {
                        warn!(node_id = change.node_id, error = %e, "Membership remove not applied");
                    }
                }
            }
        }
    }
}

impl Default for MembershipStateMachine {
    fn default() -> Self {
        Self::new(Arc::new(NodeRegistry::new()))
    }
}

impl StateMachine for MembershipStateMachine {
    fn apply(&mut self, kind: EntryKind, data: &[u8]) {
        match kind {
            EntryKind::ConfigChange => match bincode::deserialize::<MembershipChange>(data) {
                Ok(change) => self.apply_change(change),
                Err(e) => {
                    warn!(error = %e, "Undecodable membership change in committed entry");
                }
            },
            // Application payloads are opaque to the membership view.
            EntryKind::AppData | EntryKind::NoOp => {}
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let nodes = self.registry.all_nodes();
        bincode::serialize(&nodes).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        let nodes: Vec<NodeInfo> = bincode::deserialize(data)?;
        let mut map = self.registry.nodes.write();
        map.clear();
        for node in nodes {
            map.insert(node.id, node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;

    fn active_node(id: NodeId) -> NodeInfo {
        let mut node = NodeInfo::new(id, format!("node-{id}"));
        node.lifecycle = NodeLifecycle::Active;
        node
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = NodeRegistry::new();
        registry.register(active_node(1)).unwrap();

        assert!(registry.contains(1));
        assert_eq!(registry.get(1).unwrap().name, "node-1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate_fails() {
        let registry = NodeRegistry::new();
        registry.register(active_node(1)).unwrap();
        let err = registry.register(active_node(1)).unwrap_err();
        assert!(matches!(err, FabricError::NodeExists(1)));
    }

    #[test]
    fn test_cluster_capacity_enforced() {
        let registry = NodeRegistry::new();
        for id in 0..MAX_CLUSTER_NODES as u64 {
            registry.register(active_node(id)).unwrap();
        }
        let err = registry.register(active_node(999)).unwrap_err();
        assert!(matches!(err, FabricError::ClusterFull(_)));
    }

    #[test]
    fn test_endpoint_cap_enforced() {
        let registry = NodeRegistry::new();
        let mut node = active_node(1);
        node.endpoints = (0..=MAX_ENDPOINTS_PER_NODE as u16)
            .map(|p| Endpoint::tcp("10.0.0.1", 9000 + p))
            .collect();
        assert!(registry.register(node).is_err());
    }

    #[test]
    fn test_lifecycle_transition_enforced() {
        let registry = NodeRegistry::new();
        registry.register(NodeInfo::new(1, "n1")).unwrap();

        // Legal progression.
        registry.set_lifecycle(1, NodeLifecycle::Discovering).unwrap();
        registry.set_lifecycle(1, NodeLifecycle::Joining).unwrap();
        registry.set_lifecycle(1, NodeLifecycle::Active).unwrap();

        // Illegal jump back.
        assert!(registry.set_lifecycle(1, NodeLifecycle::Joining).is_err());

        // Failure is always reachable.
        registry.set_lifecycle(1, NodeLifecycle::Failed).unwrap();
    }

    #[test]
    fn test_failure_streak_and_recovery() {
        let registry = NodeRegistry::new();
        registry.register(active_node(1)).unwrap();

        assert_eq!(registry.record_failure(1), 1);
        assert_eq!(registry.record_failure(1), 2);

        registry.record_heartbeat(1);
        assert_eq!(registry.get(1).unwrap().health.consecutive_failures, 0);
    }

    #[test]
    fn test_active_and_voting_filters() {
        let registry = NodeRegistry::new();
        registry.register(active_node(1)).unwrap();
        registry.register(NodeInfo::new(2, "joining")).unwrap();
        let mut learner = NodeInfo::new_learner(3, "learner");
        learner.lifecycle = NodeLifecycle::Active;
        registry.register(learner).unwrap();

        assert_eq!(registry.active_nodes().len(), 2);
        let voting = registry.voting_nodes();
        assert_eq!(voting.len(), 2);
        assert!(voting.iter().all(|n| n.id != 3));
    }

    #[test]
    fn test_state_machine_applies_add_and_remove() {
        let mut sm = MembershipStateMachine::default();
        let registry = sm.registry();

        let add = bincode::serialize(&MembershipChange {
            change_type: MembershipChangeType::AddNode,
            node_id: 7,
            node_name: Some("agent-7".into()),
            endpoints: vec![Endpoint::tcp("10.0.0.7", 7000)],
        })
        .unwrap();
        sm.apply(EntryKind::ConfigChange, &add);

        let node = registry.get(7).unwrap();
        assert_eq!(node.lifecycle, NodeLifecycle::Active);
        assert_eq!(node.endpoints.len(), 1);

        let remove = bincode::serialize(&MembershipChange {
            change_type: MembershipChangeType::RemoveNode,
            node_id: 7,
            node_name: None,
            endpoints: vec![],
        })
        .unwrap();
        sm.apply(EntryKind::ConfigChange, &remove);
        assert!(!registry.contains(7));
    }

    #[test]
    fn test_state_machine_promotes_learner() {
        let mut sm = MembershipStateMachine::default();
        let registry = sm.registry();

        let add = bincode::serialize(&MembershipChange {
            change_type: MembershipChangeType::AddLearner,
            node_id: 4,
            node_name: Some("learner-4".into()),
            endpoints: vec![],
        })
        .unwrap();
        sm.apply(EntryKind::ConfigChange, &add);
        assert!(!registry.get(4).unwrap().is_voting());

        let promote = bincode::serialize(&MembershipChange {
            change_type: MembershipChangeType::PromoteLearner,
            node_id: 4,
            node_name: None,
            endpoints: vec![],
        })
        .unwrap();
        sm.apply(EntryKind::ConfigChange, &promote);
        assert!(registry.get(4).unwrap().is_voting());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let sm = MembershipStateMachine::default();
        sm.registry().register(active_node(1)).unwrap();
        sm.registry().register(active_node(2)).unwrap();

        let blob = sm.snapshot();

        let mut restored = MembershipStateMachine::default();
        restored.restore(&blob).unwrap();
        assert_eq!(restored.registry().len(), 2);
        assert!(restored.registry().contains(1));
        assert!(restored.registry().contains(2));
    }
}
