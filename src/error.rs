//! Error types for the meshfabric cluster core.
//!
//! This module provides a unified error type [`FabricError`] for all fabric
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Transient**: timeouts, partitions, rate limiting — the caller should
//!   retry with backoff.
//! - **Rejection**: definitive denials (bad token, tampered message, abuse
//!   block) — logged to the audit trail, never retried automatically here.
//! - **Configuration**: fatal at startup; the subsystem refuses to start.
//! - **Invariant violation**: a consensus safety breach; the detecting node
//!   steps down rather than continue.
//!
//! # Example
//!
//! ```rust
//! use meshfabric::error::{FabricError, Result};
//!
//! fn submit(leader: Option<u64>) -> Result<()> {
//!     Err(FabricError::NotLeader { leader })
//! }
//!
//! let err = submit(Some(3)).unwrap_err();
//! assert!(err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for fabric operations.
#[derive(Error, Debug)]
pub enum FabricError {
    // Consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("Consensus failed: {0}")]
    Consensus(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Election timeout")]
    ElectionTimeout,

    #[error("Quorum not reached: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    #[error("Node is partitioned from the voting majority")]
    Partitioned,

    #[error("Consensus invariant violated: {0}")]
    InvariantViolation(String),

    // Membership errors
    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Node already exists: {0}")]
    NodeExists(u64),

    #[error("Cluster full: limit is {0} nodes")]
    ClusterFull(usize),

    #[error("Cluster not ready")]
    ClusterNotReady,

    #[error("No eligible node for selection")]
    NoEligibleNode,

    // Authentication and authorization errors
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    ExpiredToken,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Message guard errors
    #[error("Message integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Abuse detected from origin {origin}: score {score:.2}")]
    AbuseDetected { origin: String, score: f64 },

    // Envelope errors
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Generic operational errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Check if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::NotLeader { .. }
                | FabricError::Timeout(_)
                | FabricError::ElectionTimeout
                | FabricError::ClusterNotReady
                | FabricError::QuorumNotReached { .. }
                | FabricError::Partitioned
                | FabricError::RateLimited(_)
        )
    }

    /// Check if the error is a security rejection that must be audited.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            FabricError::InvalidToken(_)
                | FabricError::ExpiredToken
                | FabricError::NotYetValid
                | FabricError::PermissionDenied(_)
                | FabricError::IntegrityViolation(_)
                | FabricError::RateLimited(_)
                | FabricError::AbuseDetected { .. }
        )
    }

    /// Check if the error is fatal to the node's cluster participation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FabricError::Config(_)
                | FabricError::InvalidConfig { .. }
                | FabricError::InvariantViolation(_)
        )
    }
}

impl From<bincode::Error> for FabricError {
    fn from(e: bincode::Error) -> Self {
        FabricError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::Serialization(e.to_string())
    }
}

/// Result type alias for fabric operations.
pub type Result<T> = std::result::Result<T, FabricError>;
