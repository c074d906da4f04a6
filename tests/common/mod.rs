//! Shared harness: an in-process cluster of consensus nodes wired
//! through the mesh transport, with partition and crash controls.

use meshfabric::raft::{MeshNetwork, RaftConfig, RaftHandle, RaftNode};
use meshfabric::registry::{MembershipStateMachine, NodeRegistry};
use meshfabric::stats::FabricStats;
use meshfabric::types::NodeId;
use meshfabric::EventBus;
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::{sleep, Instant};

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary; honors RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestCluster {
    pub mesh: MeshNetwork,
    pub handles: HashMap<NodeId, RaftHandle>,
    pub registries: HashMap<NodeId, Arc<NodeRegistry>>,
    pub events: HashMap<NodeId, Arc<EventBus>>,
}

impl TestCluster {
    /// Spin up `voter_ids` as voting members plus `learner_ids` as
    /// non-voting replicas, all sharing one mesh.
    pub async fn start(voter_ids: &[NodeId], learner_ids: &[NodeId]) -> Self {
        init_tracing();

        let mesh = MeshNetwork::new();
        let mut handles = HashMap::new();
        let mut registries = HashMap::new();
        let mut events = HashMap::new();

        let all_voters: Vec<NodeId> = voter_ids.to_vec();

        // Learners join the mesh immediately but enter the replication
        // set only once an AddLearner change commits.
        for &id in voter_ids.iter().chain(learner_ids.iter()) {
            let is_voter = voter_ids.contains(&id);
            let config = RaftConfig {
                node_id: id,
                voters: all_voters.iter().copied().filter(|&v| v != id).collect(),
                learners: Vec::new(),
                local_voting: is_voter,
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
                ..Default::default()
            };

            let registry = Arc::new(NodeRegistry::new());
            let bus = Arc::new(EventBus::new(256));
            let (node, rx) = RaftNode::new(
                config,
                MembershipStateMachine::new(registry.clone()),
                mesh.rpc_for(id),
                bus.clone(),
                Arc::new(FabricStats::new()),
            );

            let handle = node.handle();
            mesh.register(id, handle.clone());
            handles.insert(id, handle);
            registries.insert(id, registry);
            events.insert(id, bus);

            tokio::spawn(node.run(rx));
        }

        Self {
            mesh,
            handles,
            registries,
            events,
        }
    }

    /// Wait until exactly one reachable node claims leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> NodeId {
        self.wait_for_leader_among(
            &self.handles.keys().copied().collect::<Vec<_>>(),
            timeout,
        )
        .await
    }

    /// Wait for a leader among a subset of nodes.
    pub async fn wait_for_leader_among(&self, ids: &[NodeId], timeout: Duration) -> NodeId {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leaders = Vec::new();
            for &id in ids {
                if let Some(handle) = self.handles.get(&id) {
                    if let Ok(true) = handle.is_leader().await {
                        leaders.push(id);
                    }
                }
            }
            if leaders.len() == 1 {
                return leaders[0];
            }
            if Instant::now() >= deadline {
                panic!("no single leader among {ids:?} within {timeout:?}, saw {leaders:?}");
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn handle(&self, id: NodeId) -> &RaftHandle {
        &self.handles[&id]
    }

    /// Wait until a node's registry contains (or stops containing) a member.
    pub async fn wait_for_membership(
        &self,
        on_node: NodeId,
        member: NodeId,
        present: bool,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout;
        let registry = &self.registries[&on_node];
        while registry.contains(member) != present {
            if Instant::now() >= deadline {
                panic!(
                    "node {on_node} registry never reached contains({member}) == {present}"
                );
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn shutdown(&self) {
        for handle in self.handles.values() {
            handle.shutdown().await;
        }
    }
}
