//! Per-task runtime state and its transition table.
//!
//! Owned exclusively by the scheduling loop; workers never touch it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;
use weaver_types::execution::{SkipReason, TaskExecutionResult, TaskStatus};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task '{task}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub task: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Whether `from -> to` is a legal move.
///
/// ```text
/// Pending          -> Running | Skipped | AwaitingApproval
/// Running          -> Completed | Failed
/// Failed           -> Running (retry) | Skipped (Skip policy)
/// AwaitingApproval -> Approved | Rejected | Skipped
/// Approved         -> Running | Skipped
/// ```
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running | Skipped | AwaitingApproval)
            | (Running, Completed | Failed)
            | (Failed, Running | Skipped)
            | (AwaitingApproval, Approved | Rejected | Skipped)
            | (Approved, Running | Skipped)
    )
}

/// Mutable state of one task within a run.
#[derive(Debug, Clone)]
pub struct TaskRuntimeState {
    /// Stable record id across saves.
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub output: Option<Value>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while a retry is scheduled.
    pub retry_at: Option<Instant>,
    /// Failure is handled by a dispatched trigger task.
    pub compensated: bool,
    /// A trigger source has released this compensation task.
    pub triggered: bool,
    /// Recorded in the execution result.
    pub recorded: bool,
    /// Failed or rejected tasks that alone caused this task's cascade skip,
    /// as plan indices. Empty when any other reason contributed.
    pub root_causes: BTreeSet<usize>,
}

impl TaskRuntimeState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            output: None,
            skip_reason: None,
            started_at: None,
            completed_at: None,
            retry_at: None,
            compensated: false,
            triggered: false,
            recorded: false,
            root_causes: BTreeSet::new(),
        }
    }

    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !can_transition(self.status, to) {
            return Err(InvalidTransition {
                task: self.name.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            TaskStatus::Running => {
                self.attempts += 1;
                self.retry_at = None;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Skipped
            | TaskStatus::Rejected => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending | TaskStatus::AwaitingApproval | TaskStatus::Approved => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Failed with a retry still pending counts as in progress.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Rejected => true,
            TaskStatus::Failed => self.retry_at.is_none(),
            TaskStatus::Pending
            | TaskStatus::Running
            | TaskStatus::AwaitingApproval
            | TaskStatus::Approved => false,
        }
    }

    pub fn to_result(&self, execution_id: Uuid) -> TaskExecutionResult {
        TaskExecutionResult {
            id: self.id,
            execution_id,
            task_name: self.name.clone(),
            status: self.status,
            attempts: self.attempts,
            output: self.output.clone(),
            error: self.last_error.clone(),
            skip_reason: self.skip_reason,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(can_transition(Pending, Running));
        assert!(can_transition(Pending, AwaitingApproval));
        assert!(can_transition(Running, Failed));
        assert!(can_transition(Failed, Running));
        assert!(can_transition(AwaitingApproval, Rejected));
        assert!(can_transition(Approved, Running));

        assert!(!can_transition(Completed, Running));
        assert!(!can_transition(Pending, Completed));
        assert!(!can_transition(Rejected, Running));
        assert!(!can_transition(Skipped, Running));
        assert!(!can_transition(Running, Skipped));
    }

    #[test]
    fn test_attempts_count_runs() {
        let mut state = TaskRuntimeState::new("FetchOrders");
        state.transition(TaskStatus::Running).unwrap();
        state.transition(TaskStatus::Failed).unwrap();
        state.transition(TaskStatus::Running).unwrap();
        state.transition(TaskStatus::Completed).unwrap();
        assert_eq!(state.attempts, 2);
        assert!(state.started_at.is_some());
        assert!(state.completed_at.is_some());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut state = TaskRuntimeState::new("FetchOrders");
        let err = state.transition(TaskStatus::Completed).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(state.status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_with_pending_retry_is_not_terminal() {
        let mut state = TaskRuntimeState::new("FetchOrders");
        state.transition(TaskStatus::Running).unwrap();
        state.transition(TaskStatus::Failed).unwrap();
        state.retry_at = Some(Instant::now());
        assert!(!state.is_terminal());
        state.retry_at = None;
        assert!(state.is_terminal());
    }

    #[test]
    fn test_to_result_carries_skip_reason_and_error() {
        let mut state = TaskRuntimeState::new("ShipOrders");
        state.transition(TaskStatus::Running).unwrap();
        state.transition(TaskStatus::Failed).unwrap();
        state.last_error = Some("carrier down".to_string());
        state.skip(SkipReason::ErrorPolicy).unwrap();

        let id = Uuid::now_v7();
        let result = state.to_result(id);
        assert_eq!(result.execution_id, id);
        assert_eq!(result.status, TaskStatus::Skipped);
        assert_eq!(result.skip_reason, Some(SkipReason::ErrorPolicy));
        assert_eq!(result.error.as_deref(), Some("carrier down"));
        assert_eq!(result.attempts, 1);
    }
}
