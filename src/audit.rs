//! Security audit trail.
//!
//! Every rejection and privileged action becomes an audit event with a
//! monotonic sequence number. Events flow through a bounded channel to
//! a background writer so the request path never blocks on I/O; when
//! the buffer is full the event is dropped with a warning rather than
//! stalling the caller.

use crate::config::AuditSettings;
use crate::error::Result;
use crate::events::{EventBus, FabricEvent};
use crate::stats::FabricStats;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// Subsystem an audit event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    Authorization,
    Integrity,
    RateLimit,
    Threat,
    Membership,
    Consensus,
}

/// Outcome recorded with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

/// One entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Monotonic per-process sequence, assigned at log time.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: AuditSeverity,
    pub category: AuditCategory,
    pub action: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Start building an event; sequence is assigned by the logger.
    pub fn builder(category: AuditCategory, action: impl Into<String>) -> AuditEventBuilder {
        AuditEventBuilder {
            severity: AuditSeverity::Info,
            category,
            action: action.into(),
            outcome: AuditOutcome::Success,
            subject: None,
            node_id: None,
            detail: None,
        }
    }
}

/// Builder for [`AuditEvent`].
pub struct AuditEventBuilder {
    severity: AuditSeverity,
    category: AuditCategory,
    action: String,
    outcome: AuditOutcome,
    subject: Option<String>,
    node_id: Option<NodeId>,
    detail: Option<String>,
}

impl AuditEventBuilder {
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn build(self, sequence: u64) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            severity: self.severity,
            category: self.category,
            action: self.action,
            outcome: self.outcome,
            subject: self.subject,
            node_id: self.node_id,
            detail: self.detail,
        }
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn write(&self, event: &AuditEvent) -> Result<()>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink, used in tests and for recent-event queries.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Append-only JSON-lines file sink with size-based rotation.
pub struct FileAuditSink {
    path: PathBuf,
    max_file_size: u64,
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            max_file_size,
            file: Mutex::new(file),
        })
    }

    fn rotate_locked(&self, file: &mut std::fs::File) -> Result<()> {
        file.flush()?;
        let rotated = self.path.with_extension("jsonl.1");
        std::fs::rename(&self.path, &rotated)?;
        *file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        info!(path = %self.path.display(), "Rotated audit log");
        Ok(())
    }
}

impl AuditSink for FileAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock();

        if file.metadata()?.len() + line.len() as u64 + 1 > self.max_file_size {
            self.rotate_locked(&mut file)?;
        }

        writeln!(file, "{line}")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().flush()?;
        Ok(())
    }
}

/// Front end of the audit trail: assigns sequence numbers and hands
/// events to the background writer.
pub struct AuditLogger {
    sequence: AtomicU64,
    tx: mpsc::Sender<AuditEvent>,
    stats: Arc<FabricStats>,
}

impl AuditLogger {
    /// Create a logger and spawn its writer task over the given sink,
    /// with the default buffer depth and flush cadence.
    pub fn spawn(sink: Arc<dyn AuditSink>, stats: Arc<FabricStats>) -> Arc<Self> {
        Self::spawn_with_settings(sink, stats, &AuditSettings::default())
    }

    /// Create a logger whose buffer depth and flush cadence come from
    /// the audit settings.
    pub fn spawn_with_settings(
        sink: Arc<dyn AuditSink>,
        stats: Arc<FabricStats>,
        settings: &AuditSettings,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(settings.buffer_size.max(1));
        let flush_interval = settings.flush_interval;

        tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            if let Err(e) = sink.write(&event) {
                                error!(error = %e, sequence = event.sequence, "Audit write failed");
                            }
                        }
                        None => break,
                    },
                    _ = flush_tick.tick() => {
                        if let Err(e) = sink.flush() {
                            warn!(error = %e, "Periodic audit flush failed");
                        }
                    }
                }
            }
            if let Err(e) = sink.flush() {
                warn!(error = %e, "Audit flush on shutdown failed");
            }
        });

        Arc::new(Self {
            sequence: AtomicU64::new(1),
            tx,
            stats,
        })
    }

    /// Record an event. Never blocks; ordering is fixed by the sequence
    /// number assigned here, not by write order. A full buffer sheds
    /// the event rather than stalling the request path.
    pub fn log(&self, builder: AuditEventBuilder) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = builder.build(sequence);
        self.stats.record_audit_event();
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(sequence = event.sequence, "Audit buffer full, event dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Audit writer task is gone, event dropped");
                }
            }
        }
    }
}

/// Mirror consensus and membership events from the bus onto the audit
/// trail. Guard rejections are not mirrored; the guard audits those at
/// the point of rejection.
pub fn spawn_event_auditor(
    bus: Arc<EventBus>,
    logger: Arc<AuditLogger>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event auditor fell behind the bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let builder = match event {
                FabricEvent::LeaderElected { leader_id, term } => {
                    AuditEvent::builder(AuditCategory::Consensus, "leader_elected")
                        .node(leader_id)
                        .detail(format!("term {term}"))
                }
                FabricEvent::LeaderLost { term } => {
                    AuditEvent::builder(AuditCategory::Consensus, "leader_lost")
                        .severity(AuditSeverity::Warning)
                        .detail(format!("term {term}"))
                }
                FabricEvent::PartitionSuspected { node_id, term } => {
                    AuditEvent::builder(AuditCategory::Consensus, "partition_suspected")
                        .severity(AuditSeverity::Critical)
                        .outcome(AuditOutcome::Error)
                        .node(node_id)
                        .detail(format!("term {term}"))
                }
                FabricEvent::NodeJoined { node_id } => {
                    AuditEvent::builder(AuditCategory::Membership, "node_joined").node(node_id)
                }
                FabricEvent::NodeRemoved { node_id } => {
                    AuditEvent::builder(AuditCategory::Membership, "node_removed").node(node_id)
                }
                FabricEvent::NodeFailed { node_id } => {
                    AuditEvent::builder(AuditCategory::Membership, "node_failed")
                        .severity(AuditSeverity::Warning)
                        .node(node_id)
                }
                FabricEvent::NodeRecovered { node_id } => {
                    AuditEvent::builder(AuditCategory::Membership, "node_recovered").node(node_id)
                }
                FabricEvent::LearnerPromoted { node_id } => {
                    AuditEvent::builder(AuditCategory::Membership, "learner_promoted")
                        .node(node_id)
                }
                FabricEvent::ThreatDetected { .. }
                | FabricEvent::RateLimitTripped { .. }
                | FabricEvent::AuthRejected { .. } => continue,
            };
            logger.log(builder);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::spawn(sink.clone(), Arc::new(FabricStats::new()));

        for i in 0..5 {
            logger.log(
                AuditEvent::builder(AuditCategory::Authentication, format!("login-{i}"))
                    .outcome(AuditOutcome::Denied)
                    .severity(AuditSeverity::Warning),
            );
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_builder_fields() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::spawn(sink.clone(), Arc::new(FabricStats::new()));

        logger.log(
            AuditEvent::builder(AuditCategory::Threat, "traffic_spike")
                .severity(AuditSeverity::Critical)
                .outcome(AuditOutcome::Denied)
                .subject("agent-9")
                .node(3)
                .detail("score 12.5"),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.severity, AuditSeverity::Critical);
        assert_eq!(e.subject.as_deref(), Some("agent-9"));
        assert_eq!(e.node_id, Some(3));
        assert_eq!(e.detail.as_deref(), Some("score 12.5"));
    }

    #[tokio::test]
    async fn test_file_sink_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileAuditSink::new(&path, 256).unwrap();

        for i in 0..20 {
            let event = AuditEvent::builder(AuditCategory::RateLimit, "ceiling")
                .subject(format!("agent-{i}"))
                .build(i);
            sink.write(&event).unwrap();
        }
        sink.flush().unwrap();

        // Rotation must have produced the sidecar file.
        assert!(path.exists());
        assert!(path.with_extension("jsonl.1").exists());
    }

    #[tokio::test]
    async fn test_event_auditor_mirrors_consensus_events() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::spawn(sink.clone(), Arc::new(FabricStats::new()));
        let bus = Arc::new(EventBus::new(16));
        let _task = spawn_event_auditor(bus.clone(), logger);

        tokio::task::yield_now().await;
        bus.publish(FabricEvent::LeaderElected {
            leader_id: 2,
            term: 5,
        });
        bus.publish(FabricEvent::PartitionSuspected {
            node_id: 1,
            term: 5,
        });
        // Guard events are audited at the rejection site, not here.
        bus.publish(FabricEvent::RateLimitTripped {
            subject: "agent-1".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].category, AuditCategory::Consensus);
        assert_eq!(events[0].node_id, Some(2));
        assert_eq!(events[1].severity, AuditSeverity::Critical);
    }

    #[tokio::test]
    async fn test_stats_counts_events() {
        let sink = Arc::new(MemoryAuditSink::new());
        let stats = Arc::new(FabricStats::new());
        let logger = AuditLogger::spawn(sink, stats.clone());

        logger.log(AuditEvent::builder(AuditCategory::Membership, "join"));
        logger.log(AuditEvent::builder(AuditCategory::Membership, "leave"));

        assert_eq!(stats.snapshot().audit_events, 2);
    }

    #[tokio::test]
    async fn test_buffer_depth_honors_settings() {
        let sink = Arc::new(MemoryAuditSink::new());
        let settings = AuditSettings {
            buffer_size: 4,
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let logger = AuditLogger::spawn_with_settings(
            sink.clone(),
            Arc::new(FabricStats::new()),
            &settings,
        );

        // The writer task has not been polled yet on this
        // single-threaded runtime, so everything past the buffer depth
        // is shed.
        for i in 0..10 {
            logger.log(AuditEvent::builder(
                AuditCategory::RateLimit,
                format!("burst-{i}"),
            ));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.len(), 4);
    }
}
