//! Workflow repository trait definition.
//!
//! Defines the storage interface for execution records, task records and
//! approval records. The infrastructure layer (weaver-infra) implements this
//! trait with SQLite persistence.

use uuid::Uuid;
use weaver_types::error::RepositoryError;
use weaver_types::execution::{
    ApprovalRecord, PendingApproval, TaskExecutionResult, WorkflowExecutionResult,
};

/// Repository trait for workflow execution persistence.
///
/// Covers three entity families:
/// - **Executions:** upsert/query whole-run results.
/// - **Tasks:** upsert/query per-task records, keyed by (execution, task name).
/// - **Approvals:** pending gates and the decisions that resolved them.
///
/// The engine only appends during a run. Uses native async fn in traits
/// (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert or replace an execution record by ID.
    fn save_execution(
        &self,
        execution: &WorkflowExecutionResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecutionResult>, RepositoryError>> + Send;

    /// List executions, most recently started first.
    fn list_executions(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecutionResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert or replace a task record for its (execution, task name).
    fn save_task_execution(
        &self,
        task: &TaskExecutionResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List task records of an execution in the order they were first saved.
    fn list_task_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskExecutionResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Record that a gate is waiting for a decision.
    fn request_approval(
        &self,
        pending: &PendingApproval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Pending gates, optionally limited to one execution.
    fn get_pending_approvals(
        &self,
        execution_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<PendingApproval>, RepositoryError>> + Send;

    /// Record a decision and clear the matching pending gate.
    ///
    /// Returns `Conflict` if the task already has a recorded decision.
    fn record_approval(
        &self,
        record: &ApprovalRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Drop every pending gate of an execution (the run has finished).
    fn clear_pending_approvals(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Decisions recorded for an execution, oldest first.
    fn list_approvals(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRecord>, RepositoryError>> + Send;
}
