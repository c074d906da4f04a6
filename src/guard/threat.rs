//! Traffic anomaly scoring per origin.
//!
//! Each origin's request count over a fixed observation window is
//! normalized to a rate and compared against an adaptive baseline. The
//! threat score is the ratio of windowed rate to baseline; an origin
//! whose score crosses the multiplier threshold is blocked for a
//! penalty period. The baseline starts at the configured seed and
//! drifts toward the rates actually observed in clean windows, so a
//! fabric that legitimately runs hot stops flagging its own traffic.

use crate::error::{FabricError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// EWMA gain applied when folding a completed window into the baseline.
const BASELINE_GAIN: f64 = 0.2;

/// Threat monitor configuration.
#[derive(Debug, Clone)]
pub struct ThreatConfig {
    /// Length of the observation window.
    pub window: Duration,
    /// Seed for the adaptive baseline, requests per second per origin.
    pub baseline_rps: f64,
    /// Score (windowed rate over baseline) at which an origin is blocked.
    pub score_threshold: f64,
    /// How long a flagged origin stays blocked.
    pub block_duration: Duration,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            baseline_rps: 1000.0,
            score_threshold: 10.0,
            block_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct OriginEntry {
    window_start: Instant,
    request_count: u64,
    score: f64,
    blocked_until: Option<Instant>,
}

impl OriginEntry {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            score: 0.0,
            blocked_until: None,
        }
    }
}

/// Scores request patterns per origin and blocks abusive ones.
pub struct ThreatMonitor {
    config: ThreatConfig,
    origins: RwLock<HashMap<String, OriginEntry>>,
    baseline_rps: RwLock<f64>,
}

impl ThreatMonitor {
    pub fn new(config: ThreatConfig) -> Self {
        let seed = config.baseline_rps;
        Self {
            config,
            origins: RwLock::new(HashMap::new()),
            baseline_rps: RwLock::new(seed),
        }
    }

    /// Record one request and re-score the origin. Fails while the
    /// origin is blocked or when this request pushes the score over the
    /// threshold.
    pub fn record(&self, origin: &str) -> Result<()> {
        let now = Instant::now();
        let mut origins = self.origins.write();
        let entry = origins
            .entry(origin.to_string())
            .or_insert_with(|| OriginEntry::new(now));

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return Err(FabricError::AbuseDetected {
                    origin: origin.to_string(),
                    score: entry.score,
                });
            }
            *entry = OriginEntry::new(now);
        }

        // Roll the window over, folding the completed one into the
        // baseline. Blocked windows never get here, so the baseline only
        // learns from traffic that was allowed through.
        if now.duration_since(entry.window_start) >= self.config.window {
            self.fold_into_baseline(entry.request_count);
            entry.window_start = now;
            entry.request_count = 0;
        }

        entry.request_count += 1;

        // Score against the full window length, not time elapsed so
        // far: a count is only anomalous relative to what the whole
        // window would tolerate.
        let windowed_rps = entry.request_count as f64 / self.config.window.as_secs_f64();
        entry.score = windowed_rps / *self.baseline_rps.read();

        if entry.score > self.config.score_threshold {
            entry.blocked_until = Some(now + self.config.block_duration);
            warn!(
                origin,
                score = entry.score,
                threshold = self.config.score_threshold,
                "Origin exceeded abuse threshold, blocking"
            );
            return Err(FabricError::AbuseDetected {
                origin: origin.to_string(),
                score: entry.score,
            });
        }

        Ok(())
    }

    fn fold_into_baseline(&self, completed_count: u64) {
        let observed = completed_count as f64 / self.config.window.as_secs_f64();
        let mut baseline = self.baseline_rps.write();
        *baseline = *baseline * (1.0 - BASELINE_GAIN) + observed * BASELINE_GAIN;
        debug!(baseline = *baseline, observed, "Adapted abuse baseline");
    }

    /// Current adaptive baseline in requests per second.
    pub fn baseline(&self) -> f64 {
        *self.baseline_rps.read()
    }

    /// Current score for an origin, if tracked.
    pub fn score(&self, origin: &str) -> Option<f64> {
        self.origins.read().get(origin).map(|e| e.score)
    }

    /// Whether the origin is currently blocked.
    pub fn is_blocked(&self, origin: &str) -> bool {
        self.origins
            .read()
            .get(origin)
            .and_then(|e| e.blocked_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Clear an origin's history and any block.
    pub fn reset(&self, origin: &str) {
        self.origins.write().remove(origin);
    }
}
