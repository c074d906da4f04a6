//! Consensus RPC message definitions and transport trait.

use super::LogEntry;
use crate::types::{Endpoint, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Consensus RPC messages, carried as typed payloads inside the wire
/// envelope by the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request vote from other nodes during election.
    RequestVote(RequestVoteRequest),
    /// Response to RequestVote.
    RequestVoteResponse(RequestVoteResponse),
    /// Append entries (heartbeat or log replication).
    AppendEntries(AppendEntriesRequest),
    /// Response to AppendEntries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Install a membership snapshot on a lagging follower.
    InstallSnapshot(InstallSnapshotRequest),
    /// Response to InstallSnapshot.
    InstallSnapshotResponse(InstallSnapshotResponse),
    /// Timeout now - force immediate election for leadership transfer.
    TimeoutNow(TimeoutNowRequest),
    /// Response to TimeoutNow.
    TimeoutNowResponse(TimeoutNowResponse),
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID so followers can redirect callers.
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the prev_log_index entry.
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower held the entry at prev_log_index/prev_log_term.
    pub success: bool,
    /// Index of the last replicated entry.
    pub match_index: LogIndex,
    /// Hint for where the leader should retry after a rejection.
    pub conflict_index: Option<LogIndex>,
    /// Term of the conflicting entry.
    pub conflict_term: Option<Term>,
}

/// InstallSnapshot RPC arguments.
///
/// The replicated state machine here is the cluster membership view, which
/// is small; snapshots are shipped as a single blob rather than streamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up through this index.
    pub last_included_index: LogIndex,
    /// Term of last_included_index.
    pub last_included_term: Term,
    /// Serialized membership state.
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Whether the snapshot was applied.
    pub success: bool,
}

/// TimeoutNow RPC arguments.
/// Sent by a leader to its transfer target to bypass the randomized
/// election timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID.
    pub leader_id: NodeId,
}

/// TimeoutNow RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    /// Current term.
    pub term: Term,
}

/// Membership change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChangeType {
    /// Add a new voting node to the cluster.
    AddNode,
    /// Remove a node from the cluster.
    RemoveNode,
    /// Add a non-voting learner node.
    AddLearner,
    /// Promote a caught-up learner to voting member.
    PromoteLearner,
}

/// Membership change carried in a ConfigChange log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipChange {
    pub change_type: MembershipChangeType,
    /// Node being changed.
    pub node_id: NodeId,
    /// Display name for AddNode/AddLearner.
    pub node_name: Option<String>,
    /// Advertised endpoints for AddNode/AddLearner.
    pub endpoints: Vec<Endpoint>,
}

/// Trait for the consensus RPC transport.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    /// Send RequestVote to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    /// Send InstallSnapshot to a peer.
    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> crate::Result<InstallSnapshotResponse>;

    /// Send TimeoutNow to trigger an immediate election.
    async fn timeout_now(
        &self,
        target: NodeId,
        request: TimeoutNowRequest,
    ) -> crate::Result<TimeoutNowResponse>;
}

/// In-memory RPC implementation with programmable handlers for unit tests.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type ResponseHandler = Box<dyn Fn(RaftMessage) -> RaftMessage + Send + Sync>;

    pub struct MockRpc {
        handlers: Arc<Mutex<HashMap<NodeId, ResponseHandler>>>,
    }

    impl MockRpc {
        pub fn new() -> Self {
            Self {
                handlers: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        pub async fn register_handler<F>(&self, node_id: NodeId, handler: F)
        where
            F: Fn(RaftMessage) -> RaftMessage + Send + Sync + 'static,
        {
            self.handlers.lock().await.insert(node_id, Box::new(handler));
        }
    }

    #[async_trait::async_trait]
    impl RaftRpc for MockRpc {
        async fn request_vote(
            &self,
            target: NodeId,
            request: RequestVoteRequest,
        ) -> crate::Result<RequestVoteResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::FabricError::NodeNotFound(target))?;

            match handler(RaftMessage::RequestVote(request)) {
                RaftMessage::RequestVoteResponse(resp) => Ok(resp),
                _ => Err(crate::FabricError::Internal("Unexpected response".into())),
            }
        }

        async fn append_entries(
            &self,
            target: NodeId,
            request: AppendEntriesRequest,
        ) -> crate::Result<AppendEntriesResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::FabricError::NodeNotFound(target))?;

            match handler(RaftMessage::AppendEntries(request)) {
                RaftMessage::AppendEntriesResponse(resp) => Ok(resp),
                _ => Err(crate::FabricError::Internal("Unexpected response".into())),
            }
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            request: InstallSnapshotRequest,
        ) -> crate::Result<InstallSnapshotResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::FabricError::NodeNotFound(target))?;

            match handler(RaftMessage::InstallSnapshot(request)) {
                RaftMessage::InstallSnapshotResponse(resp) => Ok(resp),
                _ => Err(crate::FabricError::Internal("Unexpected response".into())),
            }
        }

        async fn timeout_now(
            &self,
            target: NodeId,
            request: TimeoutNowRequest,
        ) -> crate::Result<TimeoutNowResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::FabricError::NodeNotFound(target))?;

            match handler(RaftMessage::TimeoutNow(request)) {
                RaftMessage::TimeoutNowResponse(resp) => Ok(resp),
                _ => Err(crate::FabricError::Internal("Unexpected response".into())),
            }
        }
    }
}
