//! Consensus engine for the replicated membership view.
//!
//! A leader is elected among voting members with randomized timeouts;
//! membership changes and application payloads are appended to a
//! replicated log and applied to the state machine once a majority of
//! voters holds them. Learners and observers replicate the log but
//! never vote or count toward quorum.

mod log;
mod mesh;
mod node;
mod rpc;
mod state;

pub use log::{EntryKind, LogEntry, RaftLog};
pub use mesh::MeshNetwork;
pub use node::{RaftCommand, RaftConfig, RaftHandle, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    MembershipChange, MembershipChangeType, RaftMessage, RaftRpc, RequestVoteRequest,
    RequestVoteResponse, TimeoutNowRequest, TimeoutNowResponse,
};
pub use state::{LeaderState, PersistentState, RaftRole, RaftState, VolatileState};

use crate::error::Result;

/// The replicated state machine driven by committed log entries.
pub trait StateMachine: Send + Sync {
    /// Apply a committed entry's payload.
    fn apply(&mut self, kind: EntryKind, data: &[u8]);

    /// Serialize the full state for snapshot shipping.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the state from a snapshot blob.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}
