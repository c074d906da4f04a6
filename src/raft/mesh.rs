//! In-process consensus transport.
//!
//! Routes RPCs between engines living in the same process over their
//! command channels. Used by local multi-node clusters and by the
//! integration tests, which additionally script partitions and crashes
//! through it.

use super::node::RaftHandle;
use super::rpc::*;
use crate::error::{FabricError, Result};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct MeshState {
    routes: HashMap<NodeId, RaftHandle>,
    /// Nodes taken offline entirely.
    down: HashSet<NodeId>,
    /// Active partition groups; nodes in different groups cannot talk.
    groups: Vec<HashSet<NodeId>>,
}

impl MeshState {
    fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        if self.down.contains(&from) || self.down.contains(&to) {
            return false;
        }
        if self.groups.is_empty() {
            return true;
        }
        self.groups
            .iter()
            .any(|g| g.contains(&from) && g.contains(&to))
    }
}

/// Shared routing table for a set of in-process consensus nodes.
#[derive(Clone, Default)]
pub struct MeshNetwork {
    state: Arc<RwLock<MeshState>>,
}

impl MeshNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's command handle under its ID.
    pub fn register(&self, node_id: NodeId, handle: RaftHandle) {
        self.state.write().routes.insert(node_id, handle);
    }

    pub fn unregister(&self, node_id: NodeId) {
        self.state.write().routes.remove(&node_id);
    }

    /// Split the network into isolated groups. Nodes absent from every
    /// group can talk to no one.
    pub fn partition(&self, groups: Vec<Vec<NodeId>>) {
        let mut state = self.state.write();
        state.groups = groups
            .into_iter()
            .map(|g| g.into_iter().collect())
            .collect();
    }

    /// Remove all partitions.
    pub fn heal(&self) {
        self.state.write().groups.clear();
    }

    /// Take a node offline without deregistering it.
    pub fn kill(&self, node_id: NodeId) {
        self.state.write().down.insert(node_id);
    }

    /// Bring a killed node back online.
    pub fn revive(&self, node_id: NodeId) {
        self.state.write().down.remove(&node_id);
    }

    /// An RPC client for outbound calls from the given node.
    pub fn rpc_for(&self, node_id: NodeId) -> Arc<dyn RaftRpc> {
        Arc::new(MeshRpc {
            source: node_id,
            state: Arc::clone(&self.state),
        })
    }
}

struct MeshRpc {
    source: NodeId,
    state: Arc<RwLock<MeshState>>,
}

impl MeshRpc {
    fn route(&self, to: NodeId) -> Result<RaftHandle> {
        let state = self.state.read();
        if !state.can_communicate(self.source, to) {
            return Err(FabricError::Timeout(0));
        }
        state
            .routes
            .get(&to)
            .cloned()
            .ok_or(FabricError::NodeNotFound(to))
    }
}

#[async_trait::async_trait]
impl RaftRpc for MeshRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.route(target)?.deliver_request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.route(target)?.deliver_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.route(target)?.deliver_install_snapshot(request).await
    }

    async fn timeout_now(
        &self,
        target: NodeId,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        self.route(target)?.deliver_timeout_now(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_blocks_cross_group_traffic() {
        let mesh = MeshNetwork::new();
        mesh.partition(vec![vec![1, 2], vec![3]]);

        let state = mesh.state.read();
        assert!(state.can_communicate(1, 2));
        assert!(!state.can_communicate(1, 3));
        assert!(!state.can_communicate(3, 2));
    }

    #[test]
    fn test_heal_restores_traffic() {
        let mesh = MeshNetwork::new();
        mesh.partition(vec![vec![1], vec![2]]);
        assert!(!mesh.state.read().can_communicate(1, 2));

        mesh.heal();
        assert!(mesh.state.read().can_communicate(1, 2));
    }

    #[test]
    fn test_killed_node_is_unreachable() {
        let mesh = MeshNetwork::new();
        mesh.kill(2);
        assert!(!mesh.state.read().can_communicate(1, 2));
        assert!(!mesh.state.read().can_communicate(2, 1));

        mesh.revive(2);
        assert!(mesh.state.read().can_communicate(1, 2));
    }

    #[tokio::test]
    async fn test_rpc_to_unknown_node_fails() {
        let mesh = MeshNetwork::new();
        let rpc = mesh.rpc_for(1);

        let request = RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let err = rpc.request_vote(9, request).await.unwrap_err();
        assert!(matches!(err, FabricError::NodeNotFound(9)));
    }
}
