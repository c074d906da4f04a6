//! The consensus engine: an actor-style node owning term, log, and
//! commit index, driven by a command channel.

use super::log::{EntryKind, LogEntry, RaftLog};
use super::rpc::*;
use super::state::*;
use super::StateMachine;
use crate::error::{FabricError, Result};
use crate::events::{EventBus, FabricEvent};
use crate::stats::FabricStats;
use crate::types::{Endpoint, LogIndex, NodeId, Term};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Consensus engine configuration for one node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Voting peer IDs (excluding this node).
    pub voters: Vec<NodeId>,
    /// Non-voting peer IDs (learners and observers).
    pub learners: Vec<NodeId>,
    /// Whether the local node is itself a voting member.
    pub local_voting: bool,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Compact the log once this many entries have been applied.
    pub compaction_threshold: u64,
    /// Minimum voting members required to accept proposals.
    pub min_cluster_size: usize,
    /// Leadership transfer deadline.
    pub transfer_leader_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            voters: Vec::new(),
            learners: Vec::new(),
            local_voting: true,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 256,
            compaction_threshold: 10_000,
            min_cluster_size: 1,
            transfer_leader_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands accepted by the consensus engine.
pub enum RaftCommand {
    /// Propose an application payload for replication.
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<Result<LogIndex>>,
    },
    /// Handle incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Handle incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Handle incoming InstallSnapshot RPC.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Handle incoming TimeoutNow RPC for leadership transfer.
    TimeoutNow {
        request: TimeoutNowRequest,
        response: oneshot::Sender<TimeoutNowResponse>,
    },
    /// Gracefully transfer leadership to another voter.
    TransferLeadership {
        target_id: NodeId,
        response: oneshot::Sender<Result<()>>,
    },
    /// Propose adding a voting node.
    AddNode {
        node_id: NodeId,
        name: String,
        endpoints: Vec<Endpoint>,
        response: oneshot::Sender<Result<()>>,
    },
    /// Propose adding a non-voting learner.
    AddLearner {
        node_id: NodeId,
        name: String,
        endpoints: Vec<Endpoint>,
        response: oneshot::Sender<Result<()>>,
    },
    /// Propose promoting a caught-up learner to voter.
    PromoteLearner {
        node_id: NodeId,
        response: oneshot::Sender<Result<()>>,
    },
    /// Propose removing a node.
    RemoveNode {
        node_id: NodeId,
        response: oneshot::Sender<Result<()>>,
    },
    /// Request a linearizable read index.
    ReadIndex {
        response: oneshot::Sender<Result<LogIndex>>,
    },
    /// Check whether this node is the leader.
    IsLeader { response: oneshot::Sender<bool> },
    /// Get the current leader ID, if known.
    GetLeader {
        response: oneshot::Sender<Option<NodeId>>,
    },
    /// Get (term, commit index) for diagnostics.
    Status {
        response: oneshot::Sender<(Term, LogIndex)>,
    },
    /// Shut down the engine.
    Shutdown,
}

/// State for an in-flight leadership transfer.
#[derive(Debug)]
struct LeaderTransferState {
    target_id: NodeId,
    started_at: Instant,
}

/// The consensus engine for a replicated membership state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: Arc<RwLock<RaftState>>,
    log: Arc<RwLock<RaftLog>>,
    state_machine: Arc<RwLock<S>>,
    rpc: Arc<dyn RaftRpc>,
    events: Arc<EventBus>,
    stats: Arc<FabricStats>,
    command_tx: mpsc::Sender<RaftCommand>,
    /// Set while the node cannot reach a quorum of voters.
    partitioned: Arc<AtomicBool>,
    /// Active leadership transfer, if any.
    leader_transfer: Arc<RwLock<Option<LeaderTransferState>>>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Create a new consensus node. Returns the node and the receiving
    /// end of its command channel, to be passed to [`RaftNode::run`].
    pub fn new(
        config: RaftConfig,
        state_machine: S,
        rpc: Arc<dyn RaftRpc>,
        events: Arc<EventBus>,
        stats: Arc<FabricStats>,
    ) -> (Self, mpsc::Receiver<RaftCommand>) {
        let mut raft_state = RaftState::new(
            config.node_id,
            config.voters.clone(),
            config.learners.clone(),
        );
        raft_state.local_voting = config.local_voting;

        let (command_tx, command_rx) = mpsc::channel(1024);

        let node = Self {
            config,
            state: Arc::new(RwLock::new(raft_state)),
            log: Arc::new(RwLock::new(RaftLog::new())),
            state_machine: Arc::new(RwLock::new(state_machine)),
            rpc,
            events,
            stats,
            command_tx,
            partitioned: Arc::new(AtomicBool::new(false)),
            leader_transfer: Arc::new(RwLock::new(None)),
        };

        (node, command_rx)
    }

    /// Get a command sender for this node.
    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand> {
        self.command_tx.clone()
    }

    /// A typed handle over the command channel.
    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Run the consensus event loop until shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand>) {
        let mut election_deadline = self.reset_election_deadline();
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);

        loop {
            let is_leader = self.state.read().is_leader();
            let may_elect = !is_leader && self.config.local_voting;

            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        RaftCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "Consensus engine shutting down");
                            break;
                        }
                        RaftCommand::Propose { data, response } => {
                            let result = self.handle_propose(EntryKind::AppData, data).await;
                            let _ = response.send(result);
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let result = self.handle_request_vote(request);
                            let _ = response.send(result);
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let result = self.handle_install_snapshot(request);
                            election_deadline = self.reset_election_deadline();
                            let _ = response.send(result);
                        }
                        RaftCommand::TimeoutNow { request, response } => {
                            let (result, elect_now) = self.handle_timeout_now(request);
                            let _ = response.send(result);
                            if elect_now {
                                // Bypass the randomized timeout.
                                election_deadline = Instant::now();
                            }
                        }
                        RaftCommand::TransferLeadership { target_id, response } => {
                            let result = self.handle_transfer_leadership(target_id).await;
                            let _ = response.send(result);
                        }
                        RaftCommand::AddNode { node_id, name, endpoints, response } => {
                            let result = self
                                .propose_membership_change(MembershipChange {
                                    change_type: MembershipChangeType::AddNode,
                                    node_id,
                                    node_name: Some(name),
                                    endpoints,
                                })
                                .await;
                            let _ = response.send(result);
                        }
                        RaftCommand::AddLearner { node_id, name, endpoints, response } => {
                            let result = self
                                .propose_membership_change(MembershipChange {
                                    change_type: MembershipChangeType::AddLearner,
                                    node_id,
                                    node_name: Some(name),
                                    endpoints,
                                })
                                .await;
                            let _ = response.send(result);
                        }
                        RaftCommand::PromoteLearner { node_id, response } => {
                            let result = self.handle_promote_learner(node_id).await;
                            let _ = response.send(result);
                        }
                        RaftCommand::RemoveNode { node_id, response } => {
                            let result = self
                                .propose_membership_change(MembershipChange {
                                    change_type: MembershipChangeType::RemoveNode,
                                    node_id,
                                    node_name: None,
                                    endpoints: Vec::new(),
                                })
                                .await;
                            let _ = response.send(result);
                        }
                        RaftCommand::ReadIndex { response } => {
                            let result = self.handle_read_index().await;
                            let _ = response.send(result);
                        }
                        RaftCommand::IsLeader { response } => {
                            let _ = response.send(self.state.read().is_leader());
                        }
                        RaftCommand::GetLeader { response } => {
                            let _ = response.send(self.state.read().leader_id);
                        }
                        RaftCommand::Status { response } => {
                            let state = self.state.read();
                            let _ = response.send((state.current_term(), state.volatile.commit_index));
                        }
                    }
                }

                // Leader heartbeat
                _ = heartbeat_interval.tick(), if is_leader => {
                    self.expire_stale_transfer();
                    self.replicate_to_all().await;
                }

                // Election timeout; non-voting nodes never elect
                _ = tokio::time::sleep_until(election_deadline), if may_elect => {
                    self.start_election().await;
                    election_deadline = self.reset_election_deadline();
                }
            }

            self.apply_committed_entries();
            self.maybe_compact();
        }
    }

    /// Whether this node currently believes it cannot reach a voter quorum.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::Relaxed)
    }

    /// Append an entry locally and fan it out.
    async fn handle_propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<LogIndex> {
        let (term, is_leader, leader_id, voting_members) = {
            let state = self.state.read();
            (
                state.current_term(),
                state.is_leader(),
                state.leader_id,
                state.voting_members(),
            )
        };

        if !is_leader {
            return Err(FabricError::NotLeader { leader: leader_id });
        }
        if voting_members < self.config.min_cluster_size {
            return Err(FabricError::ClusterNotReady);
        }
        // A partitioned leader must not accept configuration-changing
        // requests even though it still believes itself leader.
        if self.is_partitioned() {
            return Err(FabricError::Partitioned);
        }

        let index = {
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            log.append(LogEntry::new(term, index, kind, data))?;
            index
        };

        self.replicate_to_all().await;

        Ok(index)
    }

    /// Serialize and propose a membership change as a ConfigChange entry.
    async fn propose_membership_change(&self, change: MembershipChange) -> Result<()> {
        {
            let state = self.state.read();
            match change.change_type {
                MembershipChangeType::AddNode | MembershipChangeType::AddLearner => {
                    if change.node_id == self.config.node_id
                        || state.voters.contains(&change.node_id)
                        || state.learners.contains(&change.node_id)
                    {
                        return Err(FabricError::NodeExists(change.node_id));
                    }
                }
                MembershipChangeType::RemoveNode => {
                    if change.node_id != self.config.node_id
                        && !state.voters.contains(&change.node_id)
                        && !state.learners.contains(&change.node_id)
                    {
                        return Err(FabricError::NodeNotFound(change.node_id));
                    }
                }
                MembershipChangeType::PromoteLearner => {
                    if !state.learners.contains(&change.node_id) {
                        return Err(FabricError::NodeNotFound(change.node_id));
                    }
                }
            }
        }

        let data = bincode::serialize(&change)?;
        self.handle_propose(EntryKind::ConfigChange, data).await?;

        info!(
            node_id = self.config.node_id,
            target = change.node_id,
            change = ?change.change_type,
            "Proposed membership change"
        );
        Ok(())
    }

    /// Leader-side learner promotion: verify the learner is caught up to
    /// the commit index before proposing the change.
    async fn handle_promote_learner(&self, node_id: NodeId) -> Result<()> {
        let caught_up = {
            let state = self.state.read();
            if !state.is_leader() {
                return Err(FabricError::NotLeader {
                    leader: state.leader_id,
                });
            }
            if !state.learners.contains(&node_id) {
                return Err(FabricError::NodeNotFound(node_id));
            }
            let commit = state.volatile.commit_index;
            state
                .leader
                .as_ref()
                .and_then(|l| l.match_index.get(&node_id).copied())
                .map(|m| m >= commit)
                .unwrap_or(false)
        };

        if !caught_up {
            return Err(FabricError::ClusterNotReady);
        }

        self.propose_membership_change(MembershipChange {
            change_type: MembershipChangeType::PromoteLearner,
            node_id,
            node_name: None,
            endpoints: Vec::new(),
        })
        .await
    }

    /// Handle RequestVote RPC.
    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        self.stats.record_vote_requested();

        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
        }

        let vote_granted = if !self.config.local_voting {
            // Observers and learners never grant votes.
            false
        } else if request.term < state.current_term() {
            false
        } else if !state.voters.contains(&request.candidate_id) {
            // Votes may only be requested by voting members.
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            true
        };

        if vote_granted {
            self.stats.record_vote_granted();
        }

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "Handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Handle AppendEntries RPC.
    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        // Two leaders in one term is a safety breach: the lower node id
        // steps down and the incident is surfaced loudly.
        if state.is_leader() && request.term == state.current_term() {
            self.stats.record_split_brain_detection();
            error!(
                node_id = state.node_id,
                other_leader = request.leader_id,
                term = request.term,
                "Split-brain detected: competing leader in the same term"
            );
            self.events.publish(FabricEvent::PartitionSuspected {
                node_id: state.node_id,
                term: request.term,
            });
            state.become_follower(request.term, Some(request.leader_id));
        }

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
        }

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index: None,
                conflict_term: None,
            };
        }

        // A candidate that hears from the elected leader of its own term
        // lost the race and returns to following.
        if state.role.is_candidate() {
            state.become_follower(request.term, Some(request.leader_id));
        }

        state.leader_id = Some(request.leader_id);

        // Continuity check with conflict hints for fast backtracking.
        if !log.matches(request.prev_log_index, request.prev_log_term) {
            let conflict_term = log.term_at(request.prev_log_index);
            let conflict_index = if conflict_term.is_some() {
                // First index carrying the conflicting term.
                let mut idx = request.prev_log_index;
                while idx > log.first_index() && log.term_at(idx - 1) == conflict_term {
                    idx -= 1;
                }
                Some(idx)
            } else {
                Some(log.last_index() + 1)
            };

            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index,
                conflict_term,
            };
        }

        // Append new entries, truncating uncommitted conflicts.
        for entry in request.entries {
            if entry.index <= log.last_index() {
                if let Some(existing) = log.get(entry.index) {
                    if existing.term != entry.term {
                        log.truncate_from(entry.index);
                        if let Err(e) = log.append(entry) {
                            error!(error = %e, "Failed to append after conflict truncation");
                            break;
                        }
                    }
                    // Identical entry already present: skip.
                }
            } else if let Err(e) = log.append(entry) {
                error!(error = %e, "Failed to append replicated entry");
                break;
            }
        }

        // Commit index only ever moves forward, bounded by what we hold.
        if request.leader_commit > state.volatile.commit_index {
            state.volatile.commit_index = request.leader_commit.min(log.last_index());
        }

        self.stats.record_append_received();

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            conflict_index: None,
            conflict_term: None,
        }
    }

    /// Start a new election.
    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, quorum_size, voters) = {
            let mut state = self.state.write();
            let log = self.log.read();

            state.become_candidate();

            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.quorum_size(),
                state.voters.iter().copied().collect::<Vec<_>>(),
            )
        };

        info!(node_id = self.config.node_id, term, "Starting election");
        self.stats.record_election_started();

        // Single-voter cluster: win immediately.
        if voters.is_empty() && quorum_size <= 1 {
            self.win_election(term).await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let mut votes_received = 1; // self-vote

        let mut vote_futures = Vec::new();
        for peer_id in voters {
            let rpc = Arc::clone(&self.rpc);
            let req = request.clone();
            vote_futures.push(async move {
                match timeout(Duration::from_millis(100), rpc.request_vote(peer_id, req)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(vote_futures).await;

        for result in results.into_iter().flatten() {
            let (peer_id, response) = result;
            let won = {
                let mut state = self.state.write();
                // Stale responses after stepdown are discarded here by
                // term comparison, not by explicit cancellation.
                if !state.role.is_candidate() || state.current_term() != term {
                    return;
                }

                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    return;
                }

                if response.vote_granted {
                    votes_received += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer_id,
                        votes = votes_received,
                        "Received vote"
                    );
                }
                votes_received >= quorum_size
            };

            if won {
                self.win_election(term).await;
                return;
            }
        }
    }

    /// Become leader: establish authority with a no-op entry in the new
    /// term, then fan out heartbeats.
    async fn win_election(&self, term: Term) {
        {
            let mut state = self.state.write();
            if !state.role.is_candidate() || state.current_term() != term {
                return;
            }
            let mut log = self.log.write();
            state.become_leader(log.last_index());

            let noop_index = log.last_index() + 1;
            if let Err(e) = log.append(LogEntry::noop(term, noop_index)) {
                error!(error = %e, "Failed to append no-op entry");
            }
        }

        info!(
            node_id = self.config.node_id,
            term, "Won election, became leader"
        );
        self.stats.record_leader_election();
        self.partitioned.store(false, Ordering::Relaxed);
        self.events.publish(FabricEvent::LeaderElected {
            leader_id: self.config.node_id,
            term,
        });

        self.replicate_to_all().await;
    }

    /// Replicate log entries (or heartbeats) to all peers, update match
    /// indices, advance the commit index, and re-evaluate quorum
    /// reachability.
    async fn replicate_to_all(&self) {
        let (term, commit_index, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return;
            }
            (
                state.current_term(),
                state.volatile.commit_index,
                state.leader.clone(),
            )
        };

        let leader_state = match leader_state {
            Some(l) => l,
            None => return,
        };

        let peers: Vec<NodeId> = self.state.read().replication_peers().collect();
        let mut replication_futures = Vec::new();

        for peer_id in peers {
            let rpc = Arc::clone(&self.rpc);
            let next_index = *leader_state.next_index.get(&peer_id).unwrap_or(&1);

            // Followers that fell behind the compaction horizon get a
            // snapshot instead of entries.
            let needs_snapshot = next_index < self.log.read().first_index();
            if needs_snapshot {
                self.send_snapshot_to_follower(peer_id).await;
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries =
                    log.entries_from_limit(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            replication_futures.push(async move {
                match timeout(Duration::from_millis(50), rpc.append_entries(peer_id, request))
                    .await
                {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(replication_futures).await;
        self.stats.record_append_sent();

        let mut reachable_voters = usize::from(self.config.local_voting);

        let mut state = self.state.write();
        if !state.is_leader() {
            return;
        }

        for result in results.into_iter().flatten() {
            let (peer_id, response) = result;
            if state.voters.contains(&peer_id) {
                reachable_voters += 1;
            }

            if response.term > state.current_term() {
                state.become_follower(response.term, None);
                return;
            }

            if let Some(leader) = state.leader.as_mut() {
                if response.success {
                    leader.update_match(peer_id, response.match_index);
                } else if let Some(conflict_index) = response.conflict_index {
                    leader.next_index.insert(peer_id, conflict_index);
                } else {
                    leader.decrement_next(peer_id);
                }
            }
        }

        // Split-brain gate: a leader that cannot reach a voter quorum
        // marks itself partitioned and stops accepting proposals.
        let quorum = state.quorum_size();
        let was_partitioned = self.partitioned.swap(reachable_voters < quorum, Ordering::Relaxed);
        if reachable_voters < quorum && !was_partitioned {
            warn!(
                node_id = state.node_id,
                reachable = reachable_voters,
                quorum,
                "Lost contact with voter quorum"
            );
            self.stats.record_partition_event();
            self.events.publish(FabricEvent::PartitionSuspected {
                node_id: state.node_id,
                term: state.current_term(),
            });
        } else if reachable_voters >= quorum && was_partitioned {
            info!(node_id = state.node_id, "Regained contact with voter quorum");
        }

        // Advance the commit index, but never by counting replicas of a
        // previous term: the newest majority-held entry must carry the
        // current term before anything below it commits.
        let last_log_index = self.log.read().last_index();
        let new_commit = state.calculate_commit_index(last_log_index);
        if new_commit > state.volatile.commit_index {
            let commit_term = self.log.read().term_at(new_commit);
            if commit_term == Some(state.current_term()) {
                state.volatile.commit_index = new_commit;
                debug!(
                    node_id = state.node_id,
                    commit_index = new_commit,
                    "Updated commit index"
                );
            }
        }
    }

    /// Apply committed entries to the membership state machine and update
    /// the engine's own voter/learner view for config changes.
    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };

        if commit_index <= last_applied {
            return;
        }

        let entries_to_apply: Vec<_> = {
            let log = self.log.read();
            log.entries_range(last_applied + 1, commit_index)
        };

        for entry in entries_to_apply {
            if !entry.verify_checksum() {
                error!(
                    node_id = self.config.node_id,
                    index = entry.index,
                    "Committed entry failed checksum verification; refusing to apply"
                );
                return;
            }

            match entry.kind {
                EntryKind::NoOp => {}
                EntryKind::AppData => {
                    self.state_machine.write().apply(entry.kind, &entry.data);
                }
                EntryKind::ConfigChange => {
                    self.state_machine.write().apply(entry.kind, &entry.data);
                    if let Ok(change) = bincode::deserialize::<MembershipChange>(&entry.data) {
                        self.apply_membership_change(&change);
                    }
                }
            }

            self.state.write().volatile.last_applied = entry.index;
        }
    }

    /// Fold a committed membership change into the engine's peer sets.
    fn apply_membership_change(&self, change: &MembershipChange) {
        let mut state = self.state.write();
        let last_index = self.log.read().last_index();

        match change.change_type {
            MembershipChangeType::AddNode => {
                if change.node_id != self.config.node_id {
                    state.voters.insert(change.node_id);
                    if let Some(leader) = state.leader.as_mut() {
                        leader.next_index.insert(change.node_id, last_index + 1);
                        leader.match_index.insert(change.node_id, 0);
                    }
                }
                self.events.publish(FabricEvent::NodeJoined {
                    node_id: change.node_id,
                });
            }
            MembershipChangeType::AddLearner => {
                if change.node_id != self.config.node_id {
                    state.learners.insert(change.node_id);
                    if let Some(leader) = state.leader.as_mut() {
                        leader.next_index.insert(change.node_id, last_index + 1);
                        leader.match_index.insert(change.node_id, 0);
                    }
                }
                self.events.publish(FabricEvent::NodeJoined {
                    node_id: change.node_id,
                });
            }
            MembershipChangeType::PromoteLearner => {
                state.promote_learner(change.node_id);
                self.events.publish(FabricEvent::LearnerPromoted {
                    node_id: change.node_id,
                });
            }
            MembershipChangeType::RemoveNode => {
                state.voters.remove(&change.node_id);
                state.learners.remove(&change.node_id);
                if let Some(leader) = state.leader.as_mut() {
                    leader.next_index.remove(&change.node_id);
                    leader.match_index.remove(&change.node_id);
                }
                self.events.publish(FabricEvent::NodeRemoved {
                    node_id: change.node_id,
                });
            }
        }
    }

    /// Compact applied entries into a state-machine snapshot once the log
    /// grows past the threshold.
    fn maybe_compact(&self) {
        let (last_applied, first_index) = {
            let state = self.state.read();
            let log = self.log.read();
            (state.volatile.last_applied, log.first_index())
        };

        if last_applied.saturating_sub(first_index.saturating_sub(1))
            < self.config.compaction_threshold
        {
            return;
        }

        let snapshot_term = self.log.read().term_at(last_applied).unwrap_or(0);
        {
            let mut log = self.log.write();
            log.compact(last_applied, snapshot_term);
        }

        info!(
            node_id = self.config.node_id,
            last_applied, "Compacted log to snapshot"
        );
    }

    /// Generate a fresh randomized election deadline.
    fn reset_election_deadline(&self) -> Instant {
        let mut rng = rand::thread_rng();
        let timeout = rng
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }

    /// Handle InstallSnapshot RPC: replace log prefix and state machine.
    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
        }

        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        state.leader_id = Some(request.leader_id);

        if let Err(e) = self.state_machine.write().restore(&request.data) {
            error!(error = %e, "Failed to restore state machine from snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        {
            let mut log = self.log.write();
            let first = log.first_index();
            log.truncate_from(first);
            log.compact(request.last_included_index, request.last_included_term);
        }

        state.volatile.commit_index = request.last_included_index;
        state.volatile.last_applied = request.last_included_index;

        info!(
            node_id = state.node_id,
            index = request.last_included_index,
            term = request.last_included_term,
            "Installed membership snapshot"
        );

        InstallSnapshotResponse {
            term: state.current_term(),
            success: true,
        }
    }

    /// Handle TimeoutNow RPC. Returns the response and whether an
    /// immediate election should start.
    fn handle_timeout_now(&self, request: TimeoutNowRequest) -> (TimeoutNowResponse, bool) {
        let state = self.state.read();

        if request.term < state.current_term() || !self.config.local_voting {
            return (
                TimeoutNowResponse {
                    term: state.current_term(),
                },
                false,
            );
        }

        info!(
            node_id = self.config.node_id,
            from_leader = request.leader_id,
            "Received TimeoutNow, starting immediate election"
        );

        (
            TimeoutNowResponse {
                term: state.current_term(),
            },
            true,
        )
    }

    /// Graceful leadership transfer: catch the target up, then tell it
    /// to elect immediately.
    async fn handle_transfer_leadership(&self, target_id: NodeId) -> Result<()> {
        {
            let state = self.state.read();
            if !state.is_leader() {
                return Err(FabricError::NotLeader {
                    leader: state.leader_id,
                });
            }
            // Only voters can take over leadership.
            if !state.voters.contains(&target_id) {
                return Err(FabricError::NodeNotFound(target_id));
            }
        }

        *self.leader_transfer.write() = Some(LeaderTransferState {
            target_id,
            started_at: Instant::now(),
        });

        info!(
            node_id = self.config.node_id,
            target = target_id,
            "Initiating leadership transfer"
        );

        // Finish replicating our log to the target first.
        self.replicate_to_all().await;

        let target_caught_up = {
            let state = self.state.read();
            let log = self.log.read();
            state
                .leader
                .as_ref()
                .and_then(|l| l.match_index.get(&target_id).copied())
                .map(|m| m >= log.last_index())
                .unwrap_or(false)
        };

        if !target_caught_up {
            *self.leader_transfer.write() = None;
            return Err(FabricError::ClusterNotReady);
        }

        let term = self.state.read().current_term();
        let request = TimeoutNowRequest {
            term,
            leader_id: self.config.node_id,
        };

        match timeout(
            self.config.transfer_leader_timeout,
            self.rpc.timeout_now(target_id, request),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(
                    node_id = self.config.node_id,
                    target = target_id,
                    "Leadership transfer initiated"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                *self.leader_transfer.write() = None;
                Err(e)
            }
            Err(_) => {
                *self.leader_transfer.write() = None;
                Err(FabricError::Timeout(
                    self.config.transfer_leader_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Drop an in-flight transfer that has outlived its deadline.
    fn expire_stale_transfer(&self) {
        let mut transfer = self.leader_transfer.write();
        if let Some(t) = transfer.as_ref() {
            if t.started_at.elapsed() > self.config.transfer_leader_timeout {
                warn!(target = t.target_id, "Leadership transfer timed out");
                *transfer = None;
            }
        }
    }

    /// Linearizable read: confirm leadership against a quorum, then hand
    /// back the commit index the caller must wait to see applied.
    async fn handle_read_index(&self) -> Result<LogIndex> {
        let (is_leader, commit_index) = {
            let state = self.state.read();
            (state.is_leader(), state.volatile.commit_index)
        };

        if !is_leader {
            return Err(FabricError::NotLeader {
                leader: self.state.read().leader_id,
            });
        }

        self.replicate_to_all().await;

        if self.is_partitioned() {
            return Err(FabricError::Partitioned);
        }
        if !self.state.read().is_leader() {
            return Err(FabricError::NotLeader {
                leader: self.state.read().leader_id,
            });
        }

        Ok(commit_index)
    }

    /// Ship the current membership snapshot to a lagging follower.
    async fn send_snapshot_to_follower(&self, follower_id: NodeId) {
        let data = self.state_machine.read().snapshot();
        let (term, last_included_index, last_included_term) = {
            let state = self.state.read();
            let log = self.log.read();
            let idx = log.first_index().saturating_sub(1);
            (
                state.current_term(),
                idx,
                log.term_at(idx).unwrap_or(0),
            )
        };

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.config.node_id,
            last_included_index,
            last_included_term,
            data,
        };

        match timeout(
            Duration::from_secs(10),
            self.rpc.install_snapshot(follower_id, request),
        )
        .await
        {
            Ok(Ok(response)) => {
                let mut state = self.state.write();
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    return;
                }
                if response.success {
                    if let Some(leader) = state.leader.as_mut() {
                        leader.update_match(follower_id, last_included_index);
                    }
                    info!(
                        node_id = self.config.node_id,
                        follower = follower_id,
                        index = last_included_index,
                        "Snapshot installed on follower"
                    );
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, follower = follower_id, "Snapshot send failed");
            }
            Err(_) => {
                warn!(follower = follower_id, "Snapshot send timed out");
            }
        }
    }
}

/// Typed async handle over a consensus node's command channel.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<RaftCommand>,
}

impl RaftHandle {
    pub fn new(tx: mpsc::Sender<RaftCommand>) -> Self {
        Self { tx }
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> RaftCommand,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| FabricError::ChannelClosed("consensus command channel".into()))?;
        rx.await
            .map_err(|_| FabricError::ChannelClosed("consensus response channel".into()))
    }

    /// Propose an application payload; resolves to its log index.
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        self.call(|response| RaftCommand::Propose { data, response })
            .await?
    }

    pub async fn add_node(
        &self,
        node_id: NodeId,
        name: String,
        endpoints: Vec<Endpoint>,
    ) -> Result<()> {
        self.call(|response| RaftCommand::AddNode {
            node_id,
            name,
            endpoints,
            response,
        })
        .await?
    }

    pub async fn add_learner(
        &self,
        node_id: NodeId,
        name: String,
        endpoints: Vec<Endpoint>,
    ) -> Result<()> {
        self.call(|response| RaftCommand::AddLearner {
            node_id,
            name,
            endpoints,
            response,
        })
        .await?
    }

    pub async fn promote_learner(&self, node_id: NodeId) -> Result<()> {
        self.call(|response| RaftCommand::PromoteLearner { node_id, response })
            .await?
    }

    pub async fn remove_node(&self, node_id: NodeId) -> Result<()> {
        self.call(|response| RaftCommand::RemoveNode { node_id, response })
            .await?
    }

    pub async fn transfer_leadership(&self, target_id: NodeId) -> Result<()> {
        self.call(|response| RaftCommand::TransferLeadership {
            target_id,
            response,
        })
        .await?
    }

    pub async fn read_index(&self) -> Result<LogIndex> {
        self.call(|response| RaftCommand::ReadIndex { response }).await?
    }

    pub async fn is_leader(&self) -> Result<bool> {
        self.call(|response| RaftCommand::IsLeader { response }).await
    }

    pub async fn leader(&self) -> Result<Option<NodeId>> {
        self.call(|response| RaftCommand::GetLeader { response }).await
    }

    pub async fn status(&self) -> Result<(Term, LogIndex)> {
        self.call(|response| RaftCommand::Status { response }).await
    }

    /// Deliver an inbound RequestVote from the transport.
    pub async fn deliver_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(|response| RaftCommand::RequestVote { request, response })
            .await
    }

    /// Deliver an inbound AppendEntries from the transport.
    pub async fn deliver_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(|response| RaftCommand::AppendEntries { request, response })
            .await
    }

    /// Deliver an inbound InstallSnapshot from the transport.
    pub async fn deliver_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|response| RaftCommand::InstallSnapshot { request, response })
            .await
    }

    /// Deliver an inbound TimeoutNow from the transport.
    pub async fn deliver_timeout_now(
        &self,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        self.call(|response| RaftCommand::TimeoutNow { request, response })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RaftCommand::Shutdown).await;
    }
}
