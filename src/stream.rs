//! Lifecycle stream fan-out
//!
//! Every threat or action status transition is published here. Fan-out uses
//! a bounded broadcast ring: publishing never blocks and never waits for
//! slow subscribers; a subscriber that falls behind loses the oldest queued
//! updates and observes an explicit gap instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{RemediationAction, ThreatEvent};

/// Which entity a lifecycle update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Threat,
    Action,
}

/// One lifecycle transition, as delivered to stream subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleUpdate {
    pub entity: EntityKind,
    pub id: Uuid,
    /// Owning threat id; equals `id` for threat updates.
    pub threat_id: Uuid,
    pub status: String,
    pub target_resource: String,
    pub at: DateTime<Utc>,
}

impl LifecycleUpdate {
    pub fn threat(threat: &ThreatEvent) -> Self {
        Self {
            entity: EntityKind::Threat,
            id: threat.id,
            threat_id: threat.id,
            status: threat.status.to_string(),
            target_resource: threat.target_resource.clone(),
            at: Utc::now(),
        }
    }

    pub fn action(action: &RemediationAction) -> Self {
        Self {
            entity: EntityKind::Action,
            id: action.id,
            threat_id: action.threat_id,
            status: action.status.to_string(),
            target_resource: action.target_resource.clone(),
            at: Utc::now(),
        }
    }
}

/// Fan-out handle, cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<LifecycleUpdate>,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Publish a transition. Having no subscribers is normal and not an
    /// error; a full subscriber buffer drops that subscriber's oldest item.
    pub fn publish(&self, update: LifecycleUpdate) {
        let _ = self.tx.send(update);
    }

    /// Subscribe to the live sequence of transitions. The stream is
    /// unbounded and not restartable; it ends only when the receiver is
    /// dropped. A `Lagged` receive error marks a gap.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, RemediationAction};
    use tokio::sync::broadcast::error::TryRecvError;

    fn sample_action() -> RemediationAction {
        RemediationAction::new(Uuid::new_v4(), "pod-1".to_string(), ActionType::Alert, 0.7, false)
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let broadcaster = Broadcaster::new(8);
        broadcaster.publish(LifecycleUpdate::action(&sample_action()));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_updates() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let action = sample_action();
        broadcaster.publish(LifecycleUpdate::action(&action));

        let update = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(update.entity, EntityKind::Action);
        assert_eq!(update.id, action.id);
        assert_eq!(update.status, "pending");
    }

    #[test]
    fn test_slow_subscriber_sees_gap_not_blockage() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.subscribe();
        for _ in 0..5 {
            broadcaster.publish(LifecycleUpdate::action(&sample_action()));
        }
        // Oldest updates were dropped for this subscriber; the first receive
        // reports the gap, then delivery resumes.
        match rx.try_recv() {
            Err(TryRecvError::Lagged(skipped)) => assert!(skipped >= 1),
            other => panic!("expected lag, got {:?}", other),
        }
        assert!(rx.try_recv().is_ok());
    }
}
