//! Failure detection with heartbeat monitoring.
//!
//! The detector keeps a smoothed model of each node's heartbeat cadence
//! (an exponentially weighted interval estimate plus its jitter) and
//! grades how overdue the next heartbeat is against that model.
//! Verdicts come in three grades; the monitor task sweeps them
//! periodically and folds the results into the registry and event bus.

use crate::events::{EventBus, FabricEvent};
use crate::registry::NodeRegistry;
use crate::types::{NodeId, NodeLifecycle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// EWMA gain for the interval and jitter estimates.
const CADENCE_GAIN: f64 = 0.2;

/// Jitter units added to the expected interval before a heartbeat
/// counts as overdue.
const JITTER_MARGIN: f64 = 2.0;

/// How a node's silence grades against its heartbeat cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeats arriving on cadence.
    Alive,
    /// Overdue, not yet past the point of no return.
    Suspect,
    /// Silent long enough to declare the node gone.
    Dead,
}

/// Cadence model for a single node.
#[derive(Debug, Clone)]
struct CadenceTrack {
    registered_at: Instant,
    last_seen: Instant,
    /// Smoothed arrival interval in seconds.
    ewma_interval: f64,
    /// Smoothed absolute deviation from the interval estimate.
    ewma_jitter: f64,
    samples: u32,
}

impl CadenceTrack {
    fn new(now: Instant) -> Self {
        Self {
            registered_at: now,
            last_seen: now,
            ewma_interval: 0.0,
            ewma_jitter: 0.0,
            samples: 0,
        }
    }

    fn observe(&mut self, now: Instant) {
        let interval = now.duration_since(self.last_seen).as_secs_f64();
        self.last_seen = now;

        if self.samples == 0 {
            self.ewma_interval = interval;
        } else {
            let deviation = (interval - self.ewma_interval).abs();
            self.ewma_jitter =
                self.ewma_jitter * (1.0 - CADENCE_GAIN) + deviation * CADENCE_GAIN;
            self.ewma_interval =
                self.ewma_interval * (1.0 - CADENCE_GAIN) + interval * CADENCE_GAIN;
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Ratio of the current silence to the tolerated gap. Below 1.0
    /// the node is on cadence.
    fn overdue_ratio(&self, now: Instant) -> f64 {
        let tolerated = self.ewma_interval + JITTER_MARGIN * self.ewma_jitter;
        if tolerated <= 0.0 {
            return 0.0;
        }
        now.duration_since(self.last_seen).as_secs_f64() / tolerated
    }
}

/// Configuration for the failure detector.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Overdue ratio at which a node is declared dead; half of it
    /// marks the node suspect.
    pub dead_threshold: f64,
    /// Expected heartbeat cadence, used before the model has samples.
    pub heartbeat_interval: Duration,
    /// Heartbeats required before the cadence model is trusted.
    pub min_samples: u32,
    /// Newly tracked nodes are not graded for this long.
    pub grace_period: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            dead_threshold: 8.0,
            heartbeat_interval: Duration::from_secs(5),
            min_samples: 3,
            grace_period: Duration::from_secs(30),
        }
    }
}

/// Grades node liveness from heartbeat arrival cadence.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    tracks: RwLock<HashMap<NodeId, CadenceTrack>>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a node.
    pub fn register(&self, node_id: NodeId) {
        self.tracks
            .write()
            .insert(node_id, CadenceTrack::new(Instant::now()));
        info!(node_id, "Node tracked by failure detector");
    }

    /// Stop tracking a node.
    pub fn unregister(&self, node_id: NodeId) {
        self.tracks.write().remove(&node_id);
        info!(node_id, "Node dropped from failure detector");
    }

    /// Record a heartbeat, auto-tracking unknown senders.
    pub fn heartbeat(&self, node_id: NodeId) {
        let now = Instant::now();
        let mut tracks = self.tracks.write();
        match tracks.get_mut(&node_id) {
            Some(track) => {
                track.observe(now);
                debug!(node_id, "Heartbeat recorded");
            }
            None => {
                tracks.insert(node_id, CadenceTrack::new(now));
                info!(node_id, "Node auto-tracked via heartbeat");
            }
        }
    }

    /// Grade one node. `None` if it is not tracked.
    pub fn assess(&self, node_id: NodeId) -> Option<Liveness> {
        let tracks = self.tracks.read();
        let track = tracks.get(&node_id)?;
        Some(self.grade(track, Instant::now()))
    }

    /// Whether a node is tracked and not declared dead.
    pub fn is_alive(&self, node_id: NodeId) -> bool {
        matches!(
            self.assess(node_id),
            Some(Liveness::Alive | Liveness::Suspect)
        )
    }

    /// Grade every tracked node.
    pub fn sweep(&self) -> Vec<(NodeId, Liveness)> {
        let now = Instant::now();
        self.tracks
            .read()
            .iter()
            .map(|(&node_id, track)| (node_id, self.grade(track, now)))
            .collect()
    }

    fn grade(&self, track: &CadenceTrack, now: Instant) -> Liveness {
        if now.duration_since(track.registered_at) < self.config.grace_period {
            return Liveness::Alive;
        }

        // Before the model has enough samples, grade against a fixed
        // multiple of the configured cadence instead.
        let ratio = if track.samples < self.config.min_samples {
            let silence = now.duration_since(track.last_seen).as_secs_f64();
            let expected = self.config.heartbeat_interval.as_secs_f64();
            silence / (expected * 3.0) * self.config.dead_threshold
        } else {
            track.overdue_ratio(now)
        };

        if ratio >= self.config.dead_threshold {
            Liveness::Dead
        } else if ratio >= self.config.dead_threshold / 2.0 {
            Liveness::Suspect
        } else {
            Liveness::Alive
        }
    }
}

/// Background task that sweeps the detector and reflects verdicts into
/// the registry and event bus.
pub struct HeartbeatMonitor {
    detector: Arc<FailureDetector>,
    registry: Arc<NodeRegistry>,
    events: Arc<EventBus>,
    check_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        detector: Arc<FailureDetector>,
        registry: Arc<NodeRegistry>,
        events: Arc<EventBus>,
        check_interval: Duration,
    ) -> Self {
        Self {
            detector,
            registry,
            events,
            check_interval,
        }
    }

    /// Run the monitor until the shutdown signal fires.
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut dead: Vec<NodeId> = Vec::new();

        info!("Heartbeat monitor starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    dead = self.sweep_once(dead);
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One sweep: grade every node, escalate new deaths, report
    /// recoveries. Returns the new dead set.
    fn sweep_once(&self, previously_dead: Vec<NodeId>) -> Vec<NodeId> {
        let mut dead = Vec::new();

        for (node_id, verdict) in self.detector.sweep() {
            match verdict {
                Liveness::Alive => {}
                Liveness::Suspect => {
                    let streak = self.registry.record_failure(node_id);
                    debug!(node_id, streak, "Node heartbeat overdue");
                }
                Liveness::Dead => {
                    dead.push(node_id);
                    if !previously_dead.contains(&node_id) {
                        warn!(node_id, "Node declared dead");
                        self.registry.record_failure(node_id);
                        if let Err(e) =
                            self.registry.set_lifecycle(node_id, NodeLifecycle::Failed)
                        {
                            debug!(node_id, error = %e, "Lifecycle not updated for dead node");
                        }
                        self.events.publish(FabricEvent::NodeFailed { node_id });
                    }
                }
            }
        }

        for &node_id in &previously_dead {
            if !dead.contains(&node_id) && self.detector.assess(node_id).is_some() {
                info!(node_id, "Node recovered");
                self.registry.record_heartbeat(node_id);
                self.events.publish(FabricEvent::NodeRecovered { node_id });
            }
        }

        dead
    }
}
