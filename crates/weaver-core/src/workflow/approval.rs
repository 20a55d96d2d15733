//! Manual-approval gate.
//!
//! A task with an enabled gate moves to `AwaitingApproval` instead of running.
//! Decisions arrive from outside through an `ApprovalHandle` and are consumed
//! by the scheduling loop; the engine never decides on its own except when a
//! configured approval timeout elapses, which counts as a rejection.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;
use weaver_types::execution::ApprovalDecision;

/// An external approve/reject signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalSignal {
    pub task_name: String,
    pub decision: ApprovalDecision,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ApprovalError {
    #[error("run {0} has already finished")]
    RunFinished(Uuid),
}

/// Sends decisions into a running workflow. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ApprovalHandle {
    execution_id: Uuid,
    sender: mpsc::UnboundedSender<ApprovalSignal>,
}

impl ApprovalHandle {
    pub fn new(execution_id: Uuid, sender: mpsc::UnboundedSender<ApprovalSignal>) -> Self {
        Self {
            execution_id,
            sender,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn approve(&self, task_name: &str, decided_by: Option<String>) -> Result<(), ApprovalError> {
        self.submit(ApprovalSignal {
            task_name: task_name.to_string(),
            decision: ApprovalDecision::Approved,
            decided_by,
            comment: None,
        })
    }

    pub fn reject(
        &self,
        task_name: &str,
        decided_by: Option<String>,
        comment: Option<String>,
    ) -> Result<(), ApprovalError> {
        self.submit(ApprovalSignal {
            task_name: task_name.to_string(),
            decision: ApprovalDecision::Rejected,
            decided_by,
            comment,
        })
    }

    pub fn submit(&self, signal: ApprovalSignal) -> Result<(), ApprovalError> {
        self.sender
            .send(signal)
            .map_err(|_| ApprovalError::RunFinished(self.execution_id))
    }
}

/// Tasks currently suspended at their gate, with optional deadlines.
#[derive(Debug, Default)]
pub struct ApprovalGate {
    waiting: HashMap<String, Option<Instant>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&mut self, task_name: &str, deadline: Option<Instant>) {
        self.waiting.insert(task_name.to_string(), deadline);
    }

    /// Release a waiting task. Returns `false` if it was not waiting.
    pub fn resolve(&mut self, task_name: &str) -> bool {
        self.waiting.remove(task_name).is_some()
    }

    pub fn is_waiting(&self, task_name: &str) -> bool {
        self.waiting.contains_key(task_name)
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Earliest approval deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().flatten().min().copied()
    }

    /// Tasks whose deadline has passed at `now`, sorted by name.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = self
            .waiting
            .iter()
            .filter(|(_, deadline)| deadline.is_some_and(|d| d <= now))
            .map(|(name, _)| name.clone())
            .collect();
        expired.sort();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_delivers_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ApprovalHandle::new(Uuid::now_v7(), tx);
        handle.approve("ReviewOrder", Some("ops".to_string())).unwrap();
        handle
            .clone()
            .reject("ShipOrder", None, Some("no stock".to_string()))
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.decision, ApprovalDecision::Approved);
        assert_eq!(first.decided_by.as_deref(), Some("ops"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.task_name, "ShipOrder");
        assert_eq!(second.comment.as_deref(), Some("no stock"));
    }

    #[tokio::test]
    async fn test_handle_reports_finished_run() {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();
        let handle = ApprovalHandle::new(id, tx);
        drop(rx);
        assert_eq!(
            handle.approve("ReviewOrder", None),
            Err(ApprovalError::RunFinished(id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_deadlines() {
        let now = Instant::now();
        let mut gate = ApprovalGate::new();
        gate.suspend("ReviewOrder", Some(now + Duration::from_secs(60)));
        gate.suspend("SignOff", Some(now + Duration::from_secs(10)));
        gate.suspend("OpenEnded", None);

        assert_eq!(gate.len(), 3);
        assert_eq!(gate.next_deadline(), Some(now + Duration::from_secs(10)));
        assert!(gate.expired(now).is_empty());
        assert_eq!(gate.expired(now + Duration::from_secs(30)), vec!["SignOff"]);

        assert!(gate.resolve("SignOff"));
        assert!(!gate.resolve("SignOff"));
        assert!(!gate.is_waiting("SignOff"));
        assert_eq!(gate.next_deadline(), Some(now + Duration::from_secs(60)));
    }
}
