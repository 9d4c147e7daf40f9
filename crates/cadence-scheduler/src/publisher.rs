use cadence_core::TaskState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Event name for every task row mutation.
pub const TASK_UPDATE_EVENT: &str = "task_update";

/// Fire-and-forget fan-out of task state changes.
///
/// Implementations must not block and must not fail the caller; delivery is
/// best effort.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &str, task: &TaskState);
}

/// One published event.
/// Wire: `{ "event": "task_update", "payload": { "id": 1, "status": "running", ... } }`
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub event: String,
    pub payload: TaskState,
}

/// Fan-out to in-process subscribers via tokio broadcast channel.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<TaskEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New observer subscribes to the event stream. A subscriber that falls
    /// more than `capacity` events behind observes `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    /// Silently drops if no subscribers exist.
    fn publish(&self, event: &str, task: &TaskState) {
        let _ = self.tx.send(TaskEvent {
            event: event.to_string(),
            payload: task.clone(),
        });
    }
}

/// Publisher that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: &str, _task: &TaskState) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{TaskId, TaskStatus};
    use chrono::Utc;

    fn task(status: TaskStatus) -> TaskState {
        let now = Utc::now();
        TaskState {
            id: TaskId(1),
            name: "heartbeat".to_string(),
            cron_schedule: "* * * * *".to_string(),
            status,
            last_run_at: None,
            next_run_at: None,
            last_log_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_event() {
        let publisher = BroadcastPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(TASK_UPDATE_EVENT, &task(TaskStatus::Running));

        for rx in [&mut a, &mut b] {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.event, "task_update");
            assert_eq!(ev.payload.status, TaskStatus::Running);
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(TASK_UPDATE_EVENT, &task(TaskStatus::Idle));
    }

    #[test]
    fn event_wire_shape() {
        let ev = TaskEvent {
            event: TASK_UPDATE_EVENT.to_string(),
            payload: task(TaskStatus::Failed),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "task_update");
        assert_eq!(json["payload"]["status"], "failed");
        assert_eq!(json["payload"]["cronSchedule"], "* * * * *");
    }
}
