//! Configuration for the meshfabric cluster core.
//!
//! Configuration is loaded from a JSON file or built programmatically and
//! validated before any subsystem starts. A node that fails validation
//! refuses to start rather than run partially configured.

use crate::error::{FabricError, Result};
use crate::types::{Endpoint, NodeId, MAX_CLUSTER_NODES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
    pub security: SecurityConfig,
    pub guard: GuardConfig,
    pub audit: AuditSettings,
}

/// Identity and addressing of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub name: String,
    /// Endpoints this node advertises to peers.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Initial peer set (node id list), excluding the local node.
    #[serde(default)]
    pub peers: Vec<NodeId>,
}

/// Consensus engine timing and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Lower bound of the randomized election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval; must be well below the election timeout.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Maximum entries carried per append message.
    pub max_entries_per_append: usize,
    /// Compact the log to a snapshot once it exceeds this many entries.
    pub compaction_threshold: u64,
    /// Minimum number of voting members required to hold leadership.
    pub min_cluster_size: usize,
    /// Deadline for a graceful leadership transfer.
    #[serde(with = "humantime_serde")]
    pub transfer_leader_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
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

/// Token service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HMAC signing key for credentials. Must be at least 32 bytes.
    pub signing_key: String,
    /// Credential validity window.
    #[serde(with = "humantime_serde")]
    pub token_validity: Duration,
    pub issuer: String,
    pub audience: String,
    /// Auth cache TTL ceiling; entries also expire with their token.
    #[serde(with = "humantime_serde")]
    pub auth_cache_ttl: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            token_validity: Duration::from_secs(3600),
            issuer: "meshfabric".to_string(),
            audience: "fabric-agents".to_string(),
            auth_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Message guard configuration: rate limiting and abuse detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Per-subject rate window.
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,
    /// Maximum requests per subject per window.
    pub rate_ceiling: u32,
    /// Cool-down after a subject trips the ceiling.
    #[serde(with = "humantime_serde")]
    pub rate_block_duration: Duration,
    /// Number of rate-bucket shards.
    pub rate_buckets: usize,
    /// Per-origin abuse observation window.
    #[serde(with = "humantime_serde")]
    pub abuse_window: Duration,
    /// Threat score multiplier above which an origin is blocked.
    pub abuse_threshold_multiplier: f64,
    /// How long a flagged origin stays blocked.
    #[serde(with = "humantime_serde")]
    pub abuse_block_duration: Duration,
    /// Baseline requests per second for threat scoring.
    pub baseline_rps: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(60),
            rate_ceiling: 1000,
            rate_block_duration: Duration::from_secs(60),
            rate_buckets: 1024,
            abuse_window: Duration::from_secs(10),
            abuse_threshold_multiplier: 10.0,
            abuse_block_duration: Duration::from_secs(300),
            baseline_rps: 1000.0,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    pub enabled: bool,
    /// Path for the file sink; `None` keeps events in memory only.
    pub log_path: Option<String>,
    /// Rotate the file sink after this many bytes.
    pub max_file_size: u64,
    /// Bounded channel depth between producers and the writer task.
    pub buffer_size: usize,
    /// Flush interval for the background writer.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
            max_file_size: 100 * 1024 * 1024,
            buffer_size: 10_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl FabricConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() {
            return Err(FabricError::InvalidConfig {
                field: "node.name".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.node.peers.len() + 1 > MAX_CLUSTER_NODES {
            return Err(FabricError::InvalidConfig {
                field: "node.peers".into(),
                reason: format!("cluster larger than {MAX_CLUSTER_NODES} nodes"),
            });
        }
        if self.consensus.election_timeout_min >= self.consensus.election_timeout_max {
            return Err(FabricError::InvalidConfig {
                field: "consensus.election_timeout_min".into(),
                reason: "must be below election_timeout_max".into(),
            });
        }
        if self.consensus.heartbeat_interval >= self.consensus.election_timeout_min {
            return Err(FabricError::InvalidConfig {
                field: "consensus.heartbeat_interval".into(),
                reason: "must be below election_timeout_min".into(),
            });
        }
        if self.consensus.min_cluster_size == 0 {
            return Err(FabricError::InvalidConfig {
                field: "consensus.min_cluster_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.security.signing_key.len() < crate::auth::MIN_SIGNING_KEY_LENGTH {
            return Err(FabricError::InvalidConfig {
                field: "security.signing_key".into(),
                reason: format!(
                    "must be at least {} bytes",
                    crate::auth::MIN_SIGNING_KEY_LENGTH
                ),
            });
        }
        if self.guard.rate_ceiling == 0 {
            return Err(FabricError::InvalidConfig {
                field: "guard.rate_ceiling".into(),
                reason: "must be positive".into(),
            });
        }
        if self.guard.rate_buckets == 0 {
            return Err(FabricError::InvalidConfig {
                field: "guard.rate_buckets".into(),
                reason: "must be positive".into(),
            });
        }
        if self.guard.baseline_rps <= 0.0 {
            return Err(FabricError::InvalidConfig {
                field: "guard.baseline_rps".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Configuration suitable for local development and tests.
    pub fn development(id: NodeId) -> Self {
        Self {
            node: NodeConfig {
                id,
                name: format!("dev-node-{id}"),
                endpoints: vec![Endpoint::tcp("127.0.0.1", 9400 + id as u16)],
                peers: Vec::new(),
            },
            consensus: ConsensusConfig::default(),
            security: SecurityConfig {
                signing_key: "development-signing-key-0123456789abcdef".to_string(),
                ..SecurityConfig::default()
            },
            guard: GuardConfig::default(),
            audit: AuditSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        let config = FabricConfig::development(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_signing_key_rejected() {
        let mut config = FabricConfig::development(1);
        config.security.signing_key = "short".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, FabricError::InvalidConfig { field, .. } if field == "security.signing_key"));
    }

    #[test]
    fn test_heartbeat_must_undercut_election_timeout() {
        let mut config = FabricConfig::development(1);
        config.consensus.heartbeat_interval = Duration::from_millis(200);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_election_range_rejected() {
        let mut config = FabricConfig::development(1);
        config.consensus.election_timeout_min = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = FabricConfig::development(2);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FabricConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node.id, 2);
        assert_eq!(parsed.consensus.heartbeat_interval, Duration::from_millis(50));
    }
}
