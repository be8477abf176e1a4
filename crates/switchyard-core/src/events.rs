use crate::{ErrorInfo, HealthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle notification raised by any orchestration component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// An agent definition was registered (or replaced).
    AgentRegistered {
        /// Agent id.
        agent_id: String,
    },
    /// An agent definition was removed.
    AgentUnregistered {
        /// Agent id.
        agent_id: String,
    },
    /// Aggregated agent health changed value.
    AgentHealthChanged {
        /// Agent id.
        agent_id: String,
        /// Previous health.
        previous: HealthStatus,
        /// New health.
        current: HealthStatus,
    },
    /// A capability entry was registered.
    CapabilityRegistered {
        /// Owning agent.
        agent_id: String,
        /// Capability id.
        capability_id: String,
    },
    /// A capability entry was removed.
    CapabilityUnregistered {
        /// Owning agent.
        agent_id: String,
        /// Capability id.
        capability_id: String,
    },
    /// A capability entry's health changed value.
    CapabilityHealthChanged {
        /// Owning agent.
        agent_id: String,
        /// Capability id.
        capability_id: String,
        /// Previous health.
        previous: HealthStatus,
        /// New health.
        current: HealthStatus,
    },
    /// An instance record was created in `Stopped` state.
    InstanceCreated {
        /// Instance id.
        instance_id: String,
        /// Owning agent.
        agent_id: String,
    },
    /// An instance reached `Running`.
    InstanceStarted {
        /// Instance id.
        instance_id: String,
    },
    /// An instance reached `Stopped`.
    InstanceStopped {
        /// Instance id.
        instance_id: String,
    },
    /// An instance was suspended.
    InstancePaused {
        /// Instance id.
        instance_id: String,
    },
    /// A suspended instance was resumed.
    InstanceResumed {
        /// Instance id.
        instance_id: String,
    },
    /// An instance moved to `Failed`.
    InstanceFailed {
        /// Instance id.
        instance_id: String,
        /// The triggering error.
        error: ErrorInfo,
    },
    /// An instance record was removed.
    InstanceDestroyed {
        /// Instance id.
        instance_id: String,
    },
    /// A task entered the queue.
    TaskQueued {
        /// Task id.
        task_id: String,
    },
    /// A task started running.
    TaskStarted {
        /// Task id.
        task_id: String,
    },
    /// A task reported progress.
    TaskProgress {
        /// Task id.
        task_id: String,
        /// Percent complete (0..=100).
        percent: u8,
        /// Optional progress note.
        message: Option<String>,
    },
    /// A task is about to be retried.
    TaskRetrying {
        /// Task id.
        task_id: String,
        /// Attempt number about to run (1-based).
        attempt: u32,
    },
    /// A task completed.
    TaskCompleted {
        /// Task id.
        task_id: String,
    },
    /// A task failed terminally.
    TaskFailed {
        /// Task id.
        task_id: String,
        /// The failure.
        error: ErrorInfo,
    },
    /// A task was cancelled.
    TaskCancelled {
        /// Task id.
        task_id: String,
    },
}

/// An event together with its publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// When the event was published.
    pub at: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: OrchestrationEvent,
}

/// Fire-and-forget publish/subscribe channel for orchestration events.
///
/// Publishing succeeds whether or not anyone is subscribed; slow subscribers
/// lose the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish an event to current subscribers.
    pub fn publish(&self, event: OrchestrationEvent) {
        tracing::trace!(?event, "event");
        let _ = self.tx.send(EventEnvelope {
            at: Utc::now(),
            event,
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(OrchestrationEvent::TaskQueued {
            task_id: "t1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OrchestrationEvent::AgentRegistered {
            agent_id: "a1".into(),
        });
        let envelope = rx.recv().await.unwrap();
        assert_eq!(
            envelope.event,
            OrchestrationEvent::AgentRegistered {
                agent_id: "a1".into()
            }
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestrationEvent::TaskProgress {
            task_id: "t1".into(),
            percent: 40,
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_progress");
        assert_eq!(json["percent"], 40);
    }
}
