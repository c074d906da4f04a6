//! # meshfabric
//!
//! Consensus-backed cluster membership and secure message
//! authentication for a multi-node agent fabric.
//!
//! The crate has two halves:
//!
//! - **Membership**: a replicated membership view maintained by a
//!   consensus engine ([`raft`]), exposed through the [`registry`],
//!   with node selection ([`balancer`]) and liveness tracking
//!   ([`failure`]) layered on top.
//! - **Security**: credential issuance and validation ([`auth`]), and
//!   the inbound message [`guard`] combining integrity verification,
//!   rate limiting, and abuse scoring, all feeding the [`audit`] trail.
//!
//! Cross-cutting pieces: the wire [`envelope`], the [`events`] bus,
//! runtime [`stats`], and [`config`].

pub mod audit;
pub mod auth;
pub mod balancer;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod failure;
pub mod guard;
pub mod raft;
pub mod registry;
pub mod stats;
pub mod types;

pub use audit::{
    spawn_event_auditor, AuditEvent, AuditLogger, AuditSink, FileAuditSink, MemoryAuditSink,
};
pub use auth::{AuthCache, AuthContext, Permissions, TokenService};
pub use balancer::{NodeBalancer, SelectionStrategy};
pub use config::FabricConfig;
pub use envelope::{Envelope, MessageKind};
pub use error::{FabricError, Result};
pub use events::{EventBus, FabricEvent};
pub use failure::{FailureDetector, FailureDetectorConfig, HeartbeatMonitor, Liveness};
pub use guard::GuardPipeline;
pub use raft::{MeshNetwork, RaftConfig, RaftHandle, RaftNode};
pub use registry::{MembershipStateMachine, NodeRegistry};
pub use stats::{FabricStats, StatsSnapshot};
pub use types::{NodeId, NodeInfo, NodeLifecycle, NodeRole};
