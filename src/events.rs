//! Typed fabric event bus.
//!
//! Components publish membership and security events onto a broadcast
//! channel; any number of subscribers can follow along. Publishing
//! never blocks and events are dropped if no subscriber keeps up.

use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by fabric components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FabricEvent {
    /// A node won an election.
    LeaderElected { leader_id: NodeId, term: Term },
    /// The known leader became unreachable.
    LeaderLost { term: Term },
    /// A node's membership entry committed.
    NodeJoined { node_id: NodeId },
    /// A node was removed from membership.
    NodeRemoved { node_id: NodeId },
    /// The failure detector flagged a node.
    NodeFailed { node_id: NodeId },
    /// A flagged node resumed heartbeating.
    NodeRecovered { node_id: NodeId },
    /// A learner was promoted to voting member.
    LearnerPromoted { node_id: NodeId },
    /// A node lost contact with the voter quorum.
    PartitionSuspected { node_id: NodeId, term: Term },
    /// An origin's traffic exceeded the abuse multiplier.
    ThreatDetected { origin: String, score: f64 },
    /// A subject hit its request ceiling.
    RateLimitTripped { subject: String },
    /// A credential was rejected.
    AuthRejected { subject: String, reason: String },
}

/// Broadcast bus for [`FabricEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<FabricEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Lossy when there are no subscribers.
    pub fn publish(&self, event: FabricEvent) {
        trace!(?event, "Publishing fabric event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(FabricEvent::LeaderElected {
            leader_id: 3,
            term: 2,
        });

        match rx.recv().await.unwrap() {
            FabricEvent::LeaderElected { leader_id, term } => {
                assert_eq!(leader_id, 3);
                assert_eq!(term, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_lossy() {
        let bus = EventBus::new(16);
        // Must not panic or block.
        bus.publish(FabricEvent::NodeFailed { node_id: 1 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(FabricEvent::NodeJoined { node_id: 9 });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            FabricEvent::NodeJoined { node_id: 9 }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            FabricEvent::NodeJoined { node_id: 9 }
        ));
    }
}
