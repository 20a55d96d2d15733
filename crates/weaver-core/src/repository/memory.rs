//! In-memory `WorkflowRepository` backed by `DashMap`.

use dashmap::DashMap;
use uuid::Uuid;
use weaver_types::error::RepositoryError;
use weaver_types::execution::{
    ApprovalRecord, PendingApproval, TaskExecutionResult, WorkflowExecutionResult,
};

use super::workflow::WorkflowRepository;

/// Process-local repository. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    executions: DashMap<Uuid, WorkflowExecutionResult>,
    tasks: DashMap<Uuid, Vec<TaskExecutionResult>>,
    pending: DashMap<(Uuid, String), PendingApproval>,
    approvals: DashMap<Uuid, Vec<ApprovalRecord>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_execution(
        &self,
        execution: &WorkflowExecutionResult,
    ) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        if !execution.tasks.is_empty() {
            let mut entry = self.tasks.entry(execution.id).or_default();
            for task in &execution.tasks {
                entry.retain(|t| t.task_name != task.task_name);
            }
            // `tasks` is already in terminal order; unfinished records trail it.
            let rest = std::mem::take(&mut *entry);
            *entry = execution.tasks.iter().cloned().chain(rest).collect();
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecutionResult>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn list_executions(
        &self,
        limit: u32,
    ) -> Result<Vec<WorkflowExecutionResult>, RepositoryError> {
        let mut all: Vec<WorkflowExecutionResult> =
            self.executions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn save_task_execution(&self, task: &TaskExecutionResult) -> Result<(), RepositoryError> {
        let mut entry = self.tasks.entry(task.execution_id).or_default();
        if let Some(pos) = entry.iter().position(|t| t.task_name == task.task_name) {
            if entry[pos].status.is_terminal() || !task.status.is_terminal() {
                entry[pos] = task.clone();
                return Ok(());
            }
            entry.remove(pos);
        }
        // Terminal records keep the order they finished in, ahead of the rest.
        if task.status.is_terminal() {
            let at = entry.iter().take_while(|t| t.status.is_terminal()).count();
            entry.insert(at, task.clone());
        } else {
            entry.push(task.clone());
        }
        Ok(())
    }

    async fn list_task_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<TaskExecutionResult>, RepositoryError> {
        Ok(self
            .tasks
            .get(execution_id)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }

    async fn request_approval(&self, pending: &PendingApproval) -> Result<(), RepositoryError> {
        self.pending.insert(
            (pending.execution_id, pending.task_name.clone()),
            pending.clone(),
        );
        Ok(())
    }

    async fn get_pending_approvals(
        &self,
        execution_id: Option<&Uuid>,
    ) -> Result<Vec<PendingApproval>, RepositoryError> {
        let mut pending: Vec<PendingApproval> = self
            .pending
            .iter()
            .filter(|p| execution_id.is_none_or(|id| p.execution_id == *id))
            .map(|p| p.value().clone())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(pending)
    }

    async fn record_approval(&self, record: &ApprovalRecord) -> Result<(), RepositoryError> {
        let mut entry = self.approvals.entry(record.execution_id).or_default();
        if entry.iter().any(|r| r.task_name == record.task_name) {
            return Err(RepositoryError::Conflict(format!(
                "approval for task '{}' already recorded",
                record.task_name
            )));
        }
        entry.push(record.clone());
        drop(entry);
        self.pending
            .remove(&(record.execution_id, record.task_name.clone()));
        Ok(())
    }

    async fn clear_pending_approvals(&self, execution_id: &Uuid) -> Result<(), RepositoryError> {
        self.pending.retain(|(id, _), _| id != execution_id);
        Ok(())
    }

    async fn list_approvals(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ApprovalRecord>, RepositoryError> {
        Ok(self
            .approvals
            .get(execution_id)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }
}
