//! Consensus state management for a fabric node.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Election role of the local consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Passive, responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handling proposals and replication.
    Leader,
}

impl RaftRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, RaftRole::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, RaftRole::Candidate)
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// State that must survive role transitions: term and vote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<NodeId>,
}

/// Volatile state for all nodes.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest log index known to be committed.
    pub commit_index: LogIndex,
    /// Highest log index applied to the membership state machine.
    pub last_applied: LogIndex,
}

/// Per-follower replication bookkeeping, leaders only.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each peer, index of the next log entry to send.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, highest log index known to be replicated.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: impl Iterator<Item = NodeId>, last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }

        Self {
            next_index,
            match_index,
        }
    }

    /// Record a successful replication up to `match_index`.
    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    /// Back off after a continuity rejection.
    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }
}

/// Complete consensus state for one node.
#[derive(Debug)]
pub struct RaftState {
    /// This node's ID.
    pub node_id: NodeId,
    /// Current election role.
    pub role: RaftRole,
    /// Current leader ID, if known.
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Leader-only bookkeeping; `Some` iff role == Leader.
    pub leader: Option<LeaderState>,
    /// Voting peers (excluding the local node).
    pub voters: HashSet<NodeId>,
    /// Non-voting peers: learners catching up and observers. Replicated
    /// to, but never counted toward quorum and never asked for votes.
    pub learners: HashSet<NodeId>,
    /// Whether the local node itself is a voting member. Observers and
    /// learners run the engine but never start elections or grant votes.
    pub local_voting: bool,
}

impl RaftState {
    pub fn new(node_id: NodeId, voters: Vec<NodeId>, learners: Vec<NodeId>) -> Self {
        Self {
            node_id,
            role: RaftRole::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            voters: voters.into_iter().collect(),
            learners: learners.into_iter().collect(),
            local_voting: true,
        }
    }

    /// All replication targets: voters plus learners.
    pub fn replication_peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voters.iter().chain(self.learners.iter()).copied()
    }

    /// Transition to follower.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = term,
            leader = ?leader_id,
            "Became follower"
        );
    }

    /// Transition to candidate, starting a new term and voting for self.
    pub fn become_candidate(&mut self) {
        debug_assert!(self.local_voting, "non-voting node started an election");
        self.role = RaftRole::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became candidate"
        );
    }

    /// Transition to leader after winning an election.
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(self.replication_peers(), last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "Became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Number of voting members in the cluster (voters plus self if voting).
    pub fn voting_members(&self) -> usize {
        self.voters.len() + usize::from(self.local_voting)
    }

    /// Strict majority of voting members.
    pub fn quorum_size(&self) -> usize {
        self.voting_members() / 2 + 1
    }

    /// Step down if a higher term is observed. Returns true if stepped down.
    pub fn maybe_update_term(&mut self, term: Term) -> bool {
        if term > self.persistent.current_term {
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    /// Promote a learner to a voting member.
    pub fn promote_learner(&mut self, node_id: NodeId) -> bool {
        if self.learners.remove(&node_id) {
            self.voters.insert(node_id);
            true
        } else {
            false
        }
    }

    /// Calculate the commit index a majority of voters has replicated.
    ///
    /// Learner match indices are deliberately excluded: only voting
    /// replicas count toward commitment.
    pub fn calculate_commit_index(&self, last_log_index: LogIndex) -> LogIndex {
        if !self.is_leader() {
            return self.volatile.commit_index;
        }

        let leader_state = match &self.leader {
            Some(l) => l,
            None => return self.volatile.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader_state
            .match_index
            .iter()
            .filter(|(peer, _)| self.voters.contains(peer))
            .map(|(_, &idx)| idx)
            .collect();
        if self.local_voting {
            indices.push(last_log_index);
        }

        indices.sort_unstable();
        indices.reverse();

        // The index at position quorum_size - 1 is the highest index that
        // at least quorum_size voters hold.
        let quorum_idx = self.quorum_size() - 1;
        if quorum_idx < indices.len() {
            indices[quorum_idx].max(self.volatile.commit_index)
        } else {
            self.volatile.commit_index
        }
    }
}
