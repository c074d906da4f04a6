//! Per-subject request rate limiting.
//!
//! Subjects hash into a fixed shard array of sliding windows. A subject
//! that exceeds the ceiling inside one window is blocked outright for a
//! cool-down period before its counter starts fresh.

use crate::error::{FabricError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Length of the counting window.
    pub window: Duration,
    /// Requests allowed per window.
    pub max_requests: u64,
    /// How long a tripped subject stays blocked.
    pub block_duration: Duration,
    /// Number of bucket shards; rounded up to a power of two.
    pub shards: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 1000,
            block_duration: Duration::from_secs(60),
            shards: 1024,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u64,
    blocked_until: Option<Instant>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            blocked_until: None,
        }
    }
}

/// Sharded sliding-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let shard_count = config.shards.max(1).next_power_of_two();
        let shards = (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self { config, shards }
    }

    /// Stable polynomial hash so a subject maps to the same shard and
    /// bucket across processes.
    fn shard_for(&self, subject: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hash: u64 = 0;
        for byte in subject.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
        }
        &self.shards[(hash as usize) & (self.shards.len() - 1)]
    }

    /// Account one request for the subject. Fails if the subject is
    /// blocked or this request pushes it over the ceiling.
    pub fn check(&self, subject: &str) -> Result<()> {
        let now = Instant::now();
        let mut shard = self.shard_for(subject).lock();
        let bucket = shard
            .entry(subject.to_string())
            .or_insert_with(|| Bucket::new(now));

        if let Some(blocked_until) = bucket.blocked_until {
            if now < blocked_until {
                return Err(FabricError::RateLimited(subject.to_string()));
            }
            // Cool-down elapsed; start clean.
            *bucket = Bucket::new(now);
        }

        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count += 1;
        if bucket.count > self.config.max_requests {
            bucket.blocked_until = Some(now + self.config.block_duration);
            warn!(
                subject,
                count = bucket.count,
                ceiling = self.config.max_requests,
                "Subject exceeded request ceiling, blocking"
            );
            return Err(FabricError::RateLimited(subject.to_string()));
        }

        Ok(())
    }

    /// Whether the subject is currently in its cool-down.
    pub fn is_blocked(&self, subject: &str) -> bool {
        let shard = self.shard_for(subject).lock();
        shard
            .get(subject)
            .and_then(|b| b.blocked_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Drop a subject's bucket entirely.
    pub fn reset(&self, subject: &str) {
        self.shard_for(subject).lock().remove(subject);
    }

    /// Remove idle buckets older than one full window plus cool-down.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        let idle_after = self.config.window + self.config.block_duration;
        for shard in &self.shards {
            shard.lock().retain(|_, b| {
                now.duration_since(b.window_start) < idle_after
                    || b.blocked_until.map(|u| now < u).unwrap_or(false)
            });
        }
    }
}
