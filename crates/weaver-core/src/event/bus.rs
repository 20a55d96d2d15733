//! Run progress fan-out.
//!
//! The scheduler publishes every `WorkflowEvent` on one broadcast channel.
//! Consumers that follow a single run wrap their receiver in `RunEvents`,
//! which drops other runs' events and ends after `RunFinished`.

use tokio::sync::broadcast;
use uuid::Uuid;
use weaver_types::event::WorkflowEvent;

/// Channel capacity used by `EventBus::default`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast channel shared by the executor and its observers.
///
/// Cloning shares the channel. Events published while nobody is subscribed
/// are dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on, across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-run view
// ---------------------------------------------------------------------------

/// Events of one run, in publish order.
///
/// Subscribe before starting the run so `RunStarted` is not missed, then
/// wrap the receiver once the execution id is known.
pub struct RunEvents {
    receiver: broadcast::Receiver<WorkflowEvent>,
    execution_id: Uuid,
    finished: bool,
}

impl RunEvents {
    pub fn new(receiver: broadcast::Receiver<WorkflowEvent>, execution_id: Uuid) -> Self {
        Self {
            receiver,
            execution_id,
            finished: false,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Next event of this run; `None` once the run has finished or the bus
    /// is gone. Lagged events are lost, not replayed.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        while !self.finished {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        execution_id = %self.execution_id,
                        skipped,
                        "run event receiver lagged"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if event.execution_id() != self.execution_id {
                continue;
            }
            self.finished = matches!(event, WorkflowEvent::RunFinished { .. });
            return Some(event);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_types::execution::{ExecutionStatus, SkipReason};

    fn started(id: Uuid, task: &str) -> WorkflowEvent {
        WorkflowEvent::TaskStarted {
            execution_id: id,
            task_name: task.to_string(),
            attempt: 1,
        }
    }

    fn finished(id: Uuid) -> WorkflowEvent {
        WorkflowEvent::RunFinished {
            execution_id: id,
            status: ExecutionStatus::Completed,
            duration_ms: 12,
        }
    }

    fn task_name(event: &WorkflowEvent) -> Option<&str> {
        match event {
            WorkflowEvent::TaskStarted { task_name, .. }
            | WorkflowEvent::TaskSkipped { task_name, .. } => Some(task_name),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_run_events_follow_one_run_in_order() {
        let bus = EventBus::new(16);
        let (ours, other) = (Uuid::now_v7(), Uuid::now_v7());
        let mut events = RunEvents::new(bus.subscribe(), ours);

        bus.publish(started(ours, "FetchOrders"));
        bus.publish(started(other, "ChargeCard"));
        bus.publish(WorkflowEvent::TaskSkipped {
            execution_id: ours,
            task_name: "ShipOrders".to_string(),
            reason: SkipReason::UpstreamFailed,
        });
        bus.publish(finished(ours));
        bus.publish(started(ours, "LateTask"));

        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            seen.push(event);
        }
        let names: Vec<_> = seen.iter().filter_map(task_name).collect();
        assert_eq!(names, vec!["FetchOrders", "ShipOrders"]);
        assert!(matches!(seen.last(), Some(WorkflowEvent::RunFinished { .. })));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_each_observer_sees_the_run() {
        let bus = EventBus::new(16);
        let id = Uuid::now_v7();
        let mut progress = RunEvents::new(bus.subscribe(), id);
        let mut audit = RunEvents::new(bus.subscribe(), id);

        bus.clone().publish(started(id, "FetchOrders"));

        for events in [&mut progress, &mut audit] {
            let event = events.next().await.unwrap();
            assert_eq!(task_name(&event), Some("FetchOrders"));
        }
    }

    #[tokio::test]
    async fn test_lagged_observer_resumes_with_latest_events() {
        let bus = EventBus::new(4);
        let id = Uuid::now_v7();
        let mut events = RunEvents::new(bus.subscribe(), id);

        for i in 0..10 {
            bus.publish(started(id, &format!("StepTask{i}")));
        }
        bus.publish(finished(id));

        let first = events.next().await.unwrap();
        assert_ne!(task_name(&first), Some("StepTask0"));
        let mut last = first;
        while let Some(event) = events.next().await {
            last = event;
        }
        assert!(matches!(last, WorkflowEvent::RunFinished { .. }));
    }

    #[tokio::test]
    async fn test_closed_bus_ends_run_events() {
        let bus = EventBus::new(4);
        let mut events = RunEvents::new(bus.subscribe(), Uuid::now_v7());
        bus.publish(started(Uuid::now_v7(), "OtherRun"));
        drop(bus);
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_publish_without_observers_is_dropped() {
        let bus = EventBus::default();
        bus.publish(finished(Uuid::now_v7()));
        assert!(format!("{bus:?}").contains("receiver_count: 0"));
    }
}
