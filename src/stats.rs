//! Runtime counters for consensus and security activity.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters, cheap to bump from any task.
#[derive(Debug, Default)]
pub struct FabricStats {
    // Consensus
    elections_started: AtomicU64,
    leader_elections: AtomicU64,
    votes_requested: AtomicU64,
    votes_granted: AtomicU64,
    appends_sent: AtomicU64,
    appends_received: AtomicU64,
    partition_events: AtomicU64,
    split_brain_detections: AtomicU64,

    // Security
    tokens_issued: AtomicU64,
    tokens_validated: AtomicU64,
    auth_failures: AtomicU64,
    auth_cache_hits: AtomicU64,
    auth_cache_misses: AtomicU64,
    messages_verified: AtomicU64,
    integrity_failures: AtomicU64,
    rate_limited: AtomicU64,
    threats_detected: AtomicU64,
    audit_events: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl FabricStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_election_started, elections_started);
    counter!(record_leader_election, leader_elections);
    counter!(record_vote_requested, votes_requested);
    counter!(record_vote_granted, votes_granted);
    counter!(record_append_sent, appends_sent);
    counter!(record_append_received, appends_received);
    counter!(record_partition_event, partition_events);
    counter!(record_split_brain_detection, split_brain_detections);

    counter!(record_token_issued, tokens_issued);
    counter!(record_token_validated, tokens_validated);
    counter!(record_auth_failure, auth_failures);
    counter!(record_auth_cache_hit, auth_cache_hits);
    counter!(record_auth_cache_miss, auth_cache_misses);
    counter!(record_message_verified, messages_verified);
    counter!(record_integrity_failure, integrity_failures);
    counter!(record_rate_limited, rate_limited);
    counter!(record_threat_detected, threats_detected);
    counter!(record_audit_event, audit_events);

    /// Consistent point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elections_started: self.elections_started.load(Ordering::Relaxed),
            leader_elections: self.leader_elections.load(Ordering::Relaxed),
            votes_requested: self.votes_requested.load(Ordering::Relaxed),
            votes_granted: self.votes_granted.load(Ordering::Relaxed),
            appends_sent: self.appends_sent.load(Ordering::Relaxed),
            appends_received: self.appends_received.load(Ordering::Relaxed),
            partition_events: self.partition_events.load(Ordering::Relaxed),
            split_brain_detections: self.split_brain_detections.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            tokens_validated: self.tokens_validated.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            auth_cache_hits: self.auth_cache_hits.load(Ordering::Relaxed),
            auth_cache_misses: self.auth_cache_misses.load(Ordering::Relaxed),
            messages_verified: self.messages_verified.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            threats_detected: self.threats_detected.load(Ordering::Relaxed),
            audit_events: self.audit_events.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the fabric counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub elections_started: u64,
    pub leader_elections: u64,
    pub votes_requested: u64,
    pub votes_granted: u64,
    pub appends_sent: u64,
    pub appends_received: u64,
    pub partition_events: u64,
    pub split_brain_detections: u64,
    pub tokens_issued: u64,
    pub tokens_validated: u64,
    pub auth_failures: u64,
    pub auth_cache_hits: u64,
    pub auth_cache_misses: u64,
    pub messages_verified: u64,
    pub integrity_failures: u64,
    pub rate_limited: u64,
    pub threats_detected: u64,
    pub audit_events: u64,
}

impl StatsSnapshot {
    /// Cache hit ratio in [0, 1]; zero when the cache is untouched.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.auth_cache_hits + self.auth_cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.auth_cache_hits as f64 / total as f64
    }
}
