//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `weaver-core` using sqlx with split
//! read/write pools. Executions, task records, pending gates and approval
//! decisions each get their own table; task records keep the order in which
//! they were first saved.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;
use weaver_core::repository::workflow::WorkflowRepository;
use weaver_types::error::RepositoryError;
use weaver_types::execution::{
    ApprovalRecord, PendingApproval, TaskExecutionResult, WorkflowExecutionResult,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_name: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecutionResult, RepositoryError> {
        Ok(WorkflowExecutionResult {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            status: parse_enum(&self.status, "execution status")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            tasks: Vec::new(),
        })
    }
}

struct TaskRow {
    id: String,
    execution_id: String,
    task_name: String,
    status: String,
    attempts: i64,
    output: Option<String>,
    error: Option<String>,
    skip_reason: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            task_name: row.try_get("task_name")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            skip_reason: row.try_get("skip_reason")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<TaskExecutionResult, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid task output JSON: {e}")))
            })
            .transpose()?;

        Ok(TaskExecutionResult {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            task_name: self.task_name,
            status: parse_enum(&self.status, "task status")?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| RepositoryError::Query(format!("invalid attempts: {}", self.attempts)))?,
            output,
            error: self.error,
            skip_reason: self
                .skip_reason
                .as_deref()
                .map(|s| parse_enum(s, "skip reason"))
                .transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct PendingRow {
    execution_id: String,
    task_name: String,
    message: Option<String>,
    approvers: String,
    requested_at: String,
    expires_at: Option<String>,
}

impl PendingRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            task_name: row.try_get("task_name")?,
            message: row.try_get("message")?,
            approvers: row.try_get("approvers")?,
            requested_at: row.try_get("requested_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn into_pending(self) -> Result<PendingApproval, RepositoryError> {
        let approvers: Vec<String> = serde_json::from_str(&self.approvers)
            .map_err(|e| RepositoryError::Query(format!("invalid approvers JSON: {e}")))?;

        Ok(PendingApproval {
            execution_id: parse_uuid(&self.execution_id)?,
            task_name: self.task_name,
            message: self.message,
            approvers,
            requested_at: parse_datetime(&self.requested_at)?,
            expires_at: self.expires_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct ApprovalRow {
    execution_id: String,
    task_name: String,
    decision: String,
    decided_by: Option<String>,
    comment: Option<String>,
    decided_at: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            task_name: row.try_get("task_name")?,
            decision: row.try_get("decision")?,
            decided_by: row.try_get("decided_by")?,
            comment: row.try_get("comment")?,
            decided_at: row.try_get("decided_at")?,
        })
    }

    fn into_record(self) -> Result<ApprovalRecord, RepositoryError> {
        Ok(ApprovalRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            task_name: self.task_name,
            decision: parse_enum(&self.decision, "approval decision")?,
            decided_by: self.decided_by,
            comment: self.comment,
            decided_at: parse_datetime(&self.decided_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Unit enum -> its serde string form.
fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value).map_err(|e| RepositoryError::Query(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(RepositoryError::Query(format!(
            "expected string enum, got {other}"
        ))),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

const TASK_UPSERT: &str = r#"INSERT INTO task_executions
    (id, execution_id, task_name, status, attempts, output, error, skip_reason,
     started_at, completed_at, terminal_seq)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(execution_id, task_name) DO UPDATE SET
        id = excluded.id,
        status = excluded.status,
        attempts = excluded.attempts,
        output = excluded.output,
        error = excluded.error,
        skip_reason = excluded.skip_reason,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at,
        terminal_seq = COALESCE(excluded.terminal_seq, task_executions.terminal_seq)"#;

/// Existing terminal position for the record, else the next free one.
const NEXT_TERMINAL_SEQ: &str = r#"SELECT COALESCE(
        (SELECT terminal_seq FROM task_executions WHERE execution_id = ? AND task_name = ?),
        (SELECT COALESCE(MAX(terminal_seq), -1) + 1 FROM task_executions WHERE execution_id = ?)
    )"#;

/// Bind one task record onto `TASK_UPSERT`.
fn bind_task<'q>(
    task: &'q TaskExecutionResult,
    terminal_seq: Option<i64>,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, RepositoryError>
{
    let output = task
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let skip_reason = task.skip_reason.as_ref().map(enum_str).transpose()?;

    Ok(sqlx::query(TASK_UPSERT)
        .bind(task.id.to_string())
        .bind(task.execution_id.to_string())
        .bind(&task.task_name)
        .bind(enum_str(&task.status)?)
        .bind(i64::from(task.attempts))
        .bind(output)
        .bind(&task.error)
        .bind(skip_reason)
        .bind(task.started_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .bind(terminal_seq))
}

// ---------------------------------------------------------------------------
// WorkflowRepository implementation
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    /// Upserts the run row and every task record it carries, in one transaction.
    async fn save_execution(
        &self,
        execution: &WorkflowExecutionResult,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_name, status, started_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   workflow_name = excluded.workflow_name,
                   status = excluded.status,
                   started_at = excluded.started_at,
                   completed_at = excluded.completed_at,
                   error = excluded.error"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_name)
        .bind(enum_str(&execution.status)?)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        // `tasks` is already in terminal order.
        for (position, task) in execution.tasks.iter().enumerate() {
            let terminal_seq = i64::try_from(position)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            bind_task(task, Some(terminal_seq))?
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    /// Includes the execution's task records.
    async fn get_execution(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowExecutionResult>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, workflow_name, status, started_at, completed_at, error FROM workflow_executions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut execution = ExecutionRow::from_row(&row)
            .map_err(query_err)?
            .into_execution()?;
        execution.tasks = self.list_task_executions(id).await?;
        Ok(Some(execution))
    }

    /// Summaries only: `tasks` is left empty.
    async fn list_executions(
        &self,
        limit: u32,
    ) -> Result<Vec<WorkflowExecutionResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, workflow_name, status, started_at, completed_at, error FROM workflow_executions ORDER BY started_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_err)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    /// A record reaching a terminal status for the first time takes the
    /// next terminal position; earlier non-terminal saves leave it unset.
    async fn save_task_execution(&self, task: &TaskExecutionResult) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let terminal_seq = if task.status.is_terminal() {
            let execution_id = task.execution_id.to_string();
            let seq: i64 = sqlx::query_scalar(NEXT_TERMINAL_SEQ)
                .bind(&execution_id)
                .bind(&task.task_name)
                .bind(&execution_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
            Some(seq)
        } else {
            None
        };

        bind_task(task, terminal_seq)?
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn list_task_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<TaskExecutionResult>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, execution_id, task_name, status, attempts, output, error, skip_reason,
                      started_at, completed_at
               FROM task_executions WHERE execution_id = ?
               ORDER BY terminal_seq IS NULL, terminal_seq ASC, seq ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskRow::from_row(row).map_err(query_err)?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    async fn request_approval(&self, pending: &PendingApproval) -> Result<(), RepositoryError> {
        let approvers = serde_json::to_string(&pending.approvers)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO pending_approvals
               (execution_id, task_name, message, approvers, requested_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, task_name) DO UPDATE SET
                   message = excluded.message,
                   approvers = excluded.approvers,
                   requested_at = excluded.requested_at,
                   expires_at = excluded.expires_at"#,
        )
        .bind(pending.execution_id.to_string())
        .bind(&pending.task_name)
        .bind(&pending.message)
        .bind(&approvers)
        .bind(format_datetime(&pending.requested_at))
        .bind(pending.expires_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_pending_approvals(
        &self,
        execution_id: Option<&Uuid>,
    ) -> Result<Vec<PendingApproval>, RepositoryError> {
        let rows = match execution_id {
            Some(id) => {
                sqlx::query(
                    r#"SELECT execution_id, task_name, message, approvers, requested_at, expires_at
                       FROM pending_approvals WHERE execution_id = ? ORDER BY requested_at ASC"#,
                )
                .bind(id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT execution_id, task_name, message, approvers, requested_at, expires_at
                       FROM pending_approvals ORDER BY requested_at ASC"#,
                )
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = PendingRow::from_row(row).map_err(query_err)?;
            pending.push(r.into_pending()?);
        }
        Ok(pending)
    }

    /// Inserts the decision and drops the matching pending gate atomically.
    async fn record_approval(&self, record: &ApprovalRecord) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let inserted = sqlx::query(
            r#"INSERT INTO approvals
               (execution_id, task_name, decision, decided_by, comment, decided_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.task_name)
        .bind(enum_str(&record.decision)?)
        .bind(&record.decided_by)
        .bind(&record.comment)
        .bind(format_datetime(&record.decided_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(RepositoryError::Conflict(format!(
                    "approval for task '{}' already recorded",
                    record.task_name
                )));
            }
            Err(e) => return Err(query_err(e)),
        }

        sqlx::query("DELETE FROM pending_approvals WHERE execution_id = ? AND task_name = ?")
            .bind(record.execution_id.to_string())
            .bind(&record.task_name)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn clear_pending_approvals(&self, execution_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM pending_approvals WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_approvals(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ApprovalRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT execution_id, task_name, decision, decided_by, comment, decided_at
               FROM approvals WHERE execution_id = ? ORDER BY seq ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ApprovalRow::from_row(row).map_err(query_err)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}
