//! In-process topic-based publish/subscribe used for all cross-component
//! notifications.
//!
//! Delivery is best-effort: a slow subscriber can miss events (dropped by
//! the underlying broadcast channel once its lag exceeds capacity). This is
//! safe because every publisher persists state before publishing
//! ("persist then announce") — a missed event never loses durable state,
//! only a wakeup, and schedulers compensate by running full rounds anyway.

use crate::models::{AgentId, EndpointId, GoalId, TaskId};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    TaskSubmitted { task_id: TaskId },
    TaskAssigned { task_id: TaskId, agent_id: AgentId, generation: u64 },
    TaskCompleted { task_id: TaskId },
    TaskRetried { task_id: TaskId },
    TaskDeadLetter { task_id: TaskId },
    TaskReclaimed { task_id: TaskId },
    StaleGenerationRejected { task_id: TaskId, expected: u64, actual: u64 },

    AgentJoined { agent_id: AgentId },
    AgentLeft { agent_id: AgentId },
    AgentIdle { agent_id: AgentId },
    StatusChanged { agent_id: AgentId },

    EndpointChanged { endpoint_id: EndpointId },

    GoalStatusChanged { goal_id: GoalId },

    CorruptionDetected { table: String },
    RecoveryComplete { table: String },
    RecoveryFailed { table: String },

    HubTransition { from: String, to: String, reason: String },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::TaskSubmitted { .. }
            | Event::TaskAssigned { .. }
            | Event::TaskCompleted { .. }
            | Event::TaskRetried { .. }
            | Event::TaskDeadLetter { .. }
            | Event::TaskReclaimed { .. }
            | Event::StaleGenerationRejected { .. } => "tasks",
            Event::AgentJoined { .. }
            | Event::AgentLeft { .. }
            | Event::AgentIdle { .. }
            | Event::StatusChanged { .. } => "agents",
            Event::EndpointChanged { .. } => "endpoints",
            Event::GoalStatusChanged { .. } => "goals",
            Event::CorruptionDetected { .. }
            | Event::RecoveryComplete { .. }
            | Event::RecoveryFailed { .. } => "storage",
            Event::HubTransition { .. } => "hub",
        }
    }
}

/// A single broadcast channel shared by every topic. Subscribers filter by
/// `Event::topic()` if they only care about a subset; a single channel keeps
/// the total per-task-id observation order trivial to reason about (one
/// sender, FIFO per publish call).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // Best-effort: no receivers or a lagging receiver is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::TaskSubmitted {
            task_id: "t1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        matches!(event, Event::TaskSubmitted { task_id } if task_id == "t1");
    }

    #[tokio::test]
    async fn a_slow_subscriber_can_lag_without_erroring_the_publisher() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY * 2) {
            bus.publish(Event::TaskSubmitted {
                task_id: format!("t{i}"),
            });
        }
        // Publishing never panics or blocks even when a receiver falls behind.
    }
}
