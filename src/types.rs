//! Core type definitions for the meshfabric cluster core.
//!
//! This module contains the fundamental data types used throughout the
//! fabric: node identity, roles, lifecycle states, endpoints, and health.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`NodeId`] = `u64`: Cluster node identifier
//! - [`Term`] = `u64`: Consensus term number
//! - [`LogIndex`] = `u64`: Consensus log position
//! - [`SequenceNumber`] = `u64`: Message sequence counter
//!
//! # Examples
//!
//! ```rust
//! use meshfabric::types::{NodeInfo, NodeRole, NodeLifecycle};
//!
//! let mut node = NodeInfo::new(1, "agent-core-1");
//! assert_eq!(node.role, NodeRole::Follower);
//! assert_eq!(node.lifecycle, NodeLifecycle::Initializing);
//!
//! node.lifecycle = NodeLifecycle::Active;
//! assert!(node.is_active());
//! assert!(node.is_voting());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Consensus term number.
pub type Term = u64;

/// Consensus log index.
pub type LogIndex = u64;

/// Monotonic per-key message sequence number.
pub type SequenceNumber = u64;

/// Maximum number of nodes in a single cluster.
pub const MAX_CLUSTER_NODES: usize = 64;

/// Maximum number of endpoints advertised per node.
pub const MAX_ENDPOINTS_PER_NODE: usize = 8;

/// Role a node plays in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Current term leader; at most one per term.
    Leader,
    /// Passive replica that votes in elections.
    Follower,
    /// Follower that has started an election.
    Candidate,
    /// Non-voting replica that receives committed state but never votes.
    Observer,
    /// Non-voting replica catching up; may be promoted once at the commit index.
    Learner,
}

impl NodeRole {
    /// Whether this role participates in elections and quorum counting.
    pub fn is_voting(&self) -> bool {
        matches!(self, NodeRole::Leader | NodeRole::Follower | NodeRole::Candidate)
    }
}

/// Lifecycle state of a cluster member.
///
/// Nodes progress `Initializing → Discovering → Joining → Active`, may
/// degrade to `Degraded` or `Partitioned`, and leave via `Leaving` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycle {
    Initializing,
    Discovering,
    Joining,
    Active,
    Degraded,
    Partitioned,
    Leaving,
    Failed,
}

impl NodeLifecycle {
    /// Whether a node in this state can serve traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self, NodeLifecycle::Active | NodeLifecycle::Degraded)
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// `Failed` is reachable from every state; `Leaving` only winds down
    /// to `Failed`.
    pub fn can_transition_to(&self, next: NodeLifecycle) -> bool {
        use NodeLifecycle::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Initializing, Discovering)
                | (Discovering, Joining)
                | (Joining, Active)
                | (Active, Degraded)
                | (Active, Partitioned)
                | (Active, Leaving)
                | (Degraded, Active)
                | (Degraded, Partitioned)
                | (Degraded, Leaving)
                | (Partitioned, Active)
                | (Partitioned, Degraded)
        )
    }
}

/// Transport flavor of a node endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Tcp,
    Udp,
    SharedMemory,
}

/// One reachable network endpoint of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub address: String,
    pub port: u16,
    /// Whether the endpoint requires mutual TLS.
    pub secure: bool,
    /// Last observed round-trip time in microseconds, if measured.
    pub latency_us: Option<u64>,
}

impl Endpoint {
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            kind: EndpointKind::Tcp,
            address: address.into(),
            port,
            secure: false,
            latency_us: None,
        }
    }
}

/// Rolling health metrics for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Reported load factor, 0.0 (idle) to 1.0 (saturated).
    pub load_factor: f64,
    /// Average response time in microseconds.
    pub avg_response_us: u64,
    /// Last time any message was received from this node.
    pub last_contact: DateTime<Utc>,
    /// Consecutive failed contact attempts.
    pub consecutive_failures: u32,
    /// Messages processed by the node since it joined.
    pub messages_processed: u64,
    /// Bytes processed by the node since it joined.
    pub bytes_processed: u64,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            load_factor: 0.0,
            avg_response_us: 0,
            last_contact: Utc::now(),
            consecutive_failures: 0,
            messages_processed: 0,
            bytes_processed: 0,
        }
    }
}

/// Full description of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub lifecycle: NodeLifecycle,
    /// Up to [`MAX_ENDPOINTS_PER_NODE`] reachable endpoints.
    pub endpoints: Vec<Endpoint>,
    pub health: NodeHealth,
    /// Fingerprint of the node's identity certificate.
    pub cert_fingerprint: Option<String>,
    /// Expiry of the identity certificate.
    pub cert_expires: Option<DateTime<Utc>>,
    /// Whether the node currently counts toward quorum.
    pub voting: bool,
}

impl NodeInfo {
    /// Create a new node record in the initial lifecycle state.
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            role: NodeRole::Follower,
            lifecycle: NodeLifecycle::Initializing,
            endpoints: Vec::new(),
            health: NodeHealth::default(),
            cert_fingerprint: None,
            cert_expires: None,
            voting: true,
        }
    }

    /// Create a non-voting learner record.
    pub fn new_learner(id: NodeId, name: impl Into<String>) -> Self {
        let mut node = Self::new(id, name);
        node.role = NodeRole::Learner;
        node.voting = false;
        node
    }

    /// Create a non-voting observer record.
    pub fn new_observer(id: NodeId, name: impl Into<String>) -> Self {
        let mut node = Self::new(id, name);
        node.role = NodeRole::Observer;
        node.voting = false;
        node
    }

    /// Whether the node is in a serving lifecycle state.
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_serving()
    }

    /// Whether the node counts toward election quorum. Observers and
    /// learners never vote regardless of the voting flag.
    pub fn is_voting(&self) -> bool {
        self.voting && self.role.is_voting()
    }

    /// Whether the node's identity certificate has expired.
    pub fn cert_expired(&self, now: DateTime<Utc>) -> bool {
        self.cert_expires.map(|exp| exp < now).unwrap_or(false)
    }
}
