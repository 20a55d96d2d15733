//! Event types for the Weaver event bus.
//!
//! `WorkflowEvent` is broadcast by the scheduler as a run progresses.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ApprovalDecision, ExecutionStatus, SkipReason};

/// Events emitted during a workflow run.
///
/// Consumed by progress displays and logging; the scheduler never reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        execution_id: Uuid,
        workflow_name: String,
        task_count: usize,
    },

    TaskStarted {
        execution_id: Uuid,
        task_name: String,
        attempt: u32,
    },

    TaskCompleted {
        execution_id: Uuid,
        task_name: String,
        attempt: u32,
        duration_ms: u64,
    },

    TaskFailed {
        execution_id: Uuid,
        task_name: String,
        attempt: u32,
        error: String,
        /// Whether the retry controller scheduled another attempt.
        will_retry: bool,
    },

    TaskSkipped {
        execution_id: Uuid,
        task_name: String,
        reason: SkipReason,
    },

    TaskAwaitingApproval {
        execution_id: Uuid,
        task_name: String,
        message: Option<String>,
    },

    TaskApprovalDecided {
        execution_id: Uuid,
        task_name: String,
        decision: ApprovalDecision,
    },

    /// A compensation task was released by a failing or rejected task.
    TriggerDispatched {
        execution_id: Uuid,
        source_task: String,
        trigger_task: String,
    },

    RunFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        duration_ms: u64,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::TaskStarted { execution_id, .. }
            | Self::TaskCompleted { execution_id, .. }
            | Self::TaskFailed { execution_id, .. }
            | Self::TaskSkipped { execution_id, .. }
            | Self::TaskAwaitingApproval { execution_id, .. }
            | Self::TaskApprovalDecided { execution_id, .. }
            | Self::TriggerDispatched { execution_id, .. }
            | Self::RunFinished { execution_id, .. } => *execution_id,
        }
    }
}
