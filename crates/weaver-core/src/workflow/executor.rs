//! Workflow executor: bounded-parallel DAG scheduling with error policies.
//!
//! A run is driven by a single scheduling loop that owns every task state,
//! the result scope and the approval gate. Workers only call the task
//! executor and hand the outcome back through the `JoinSet`; they never touch
//! shared run state.
//!
//! # Execution flow
//!
//! 1. Build the run context (declared variables plus overrides) and save a
//!    `Running` execution record.
//! 2. Resolve pending tasks in topological order: cascade skips, evaluate
//!    conditions, suspend gated tasks at their approval gate.
//! 3. Dispatch ready tasks while the parallelism semaphore has permits.
//! 4. Wait for the next event: a worker outcome, an approval signal, a retry
//!    or approval deadline, cancellation, or the workflow deadline.
//! 5. Apply the outcome (publish result, pick a branch, retry, skip, trigger
//!    compensation, or abort) and go back to 2.
//! 6. Once nothing is running, waiting or scheduled, finalize: remaining tasks
//!    are skipped, records are appended in topological order and the run
//!    status is saved.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weaver_types::error::RepositoryError;
use weaver_types::event::WorkflowEvent;
use weaver_types::execution::{
    ApprovalDecision, ApprovalRecord, ExecutionStatus, PendingApproval, SkipReason, TaskStatus,
    WorkflowExecutionResult,
};

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::approval::{ApprovalGate, ApprovalHandle, ApprovalSignal};
use super::branch::{BranchSelection, select_branch};
use super::context::RunContext;
use super::definition::WorkflowError;
use super::plan::WorkflowPlan;
use super::policy::ResolvedPolicy;
use super::retry::RetryController;
use super::state::TaskRuntimeState;
use super::task_executor::{TaskError, TaskExecutor, TaskRequest};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a cancelled or timed-out executor call may take to wind down.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Run a compiled plan to completion.
    fn execute(
        &self,
        plan: Arc<WorkflowPlan>,
        variables: BTreeMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<WorkflowExecutionResult, ExecutorError>> + Send;

    /// Cancel an active run.
    fn cancel(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the run phase.
///
/// Task failures are not errors here: they are handled by the error policy
/// and reported in the `WorkflowExecutionResult`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Workflow-level error (definition, DAG, expression).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Persisting the initial execution record failed.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A variable override names a variable the workflow does not declare.
    #[error("unknown variable '{0}': overrides may only replace declared variables")]
    UnknownVariable(String),

    /// The run is not active (finished or never started).
    #[error("workflow run {0} is not active")]
    RunFinished(Uuid),

    /// The scheduling task itself failed.
    #[error("scheduler task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Control surface of a started run.
#[derive(Debug)]
pub struct RunHandle {
    execution_id: Uuid,
    approvals: ApprovalHandle,
    cancel: CancellationToken,
    join: JoinHandle<WorkflowExecutionResult>,
}

impl RunHandle {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Handle for approving or rejecting gated tasks of this run.
    pub fn approvals(&self) -> ApprovalHandle {
        self.approvals.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<WorkflowExecutionResult, ExecutorError> {
        self.join
            .await
            .map_err(|e| ExecutorError::Join(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Bounded-parallel DAG executor.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct DagExecutor<R: WorkflowRepository> {
    repo: Arc<R>,
    event_bus: EventBus,
    /// Cancellation tokens keyed by execution id.
    runs: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<R: WorkflowRepository + 'static> DagExecutor<R> {
    pub fn new(repo: Arc<R>, event_bus: EventBus) -> Self {
        Self {
            repo,
            event_bus,
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Ids of runs whose scheduling loop is still alive.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|r| *r.key()).collect()
    }

    /// Start a run in the background.
    ///
    /// Fails only if the overrides are invalid or the initial execution
    /// record cannot be saved; everything after that is reported in the
    /// result returned by `RunHandle::wait`.
    pub async fn start(
        &self,
        plan: Arc<WorkflowPlan>,
        variables: BTreeMap<String, Value>,
    ) -> Result<RunHandle, ExecutorError> {
        let context = RunContext::new(&plan.variables, variables, plan.max_output_bytes)?;
        let execution_id = Uuid::now_v7();
        let result = WorkflowExecutionResult::started(execution_id, &plan.name);
        self.repo.save_execution(&result).await?;

        let cancel = CancellationToken::new();
        self.runs.insert(execution_id, cancel.clone());
        let (sender, signals) = mpsc::unbounded_channel();

        tracing::info!(
            execution_id = %execution_id,
            workflow = %plan.name,
            tasks = plan.len(),
            parallelism = plan.degree_of_parallelism,
            "workflow run started"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            execution_id,
            workflow_name: plan.name.clone(),
            task_count: plan.len(),
        });

        let run = RunLoop::new(
            plan,
            Arc::clone(&self.repo),
            self.event_bus.clone(),
            result,
            context,
            signals,
            cancel.clone(),
        );
        let runs = Arc::clone(&self.runs);
        let join = tokio::spawn(async move {
            let result = run.run().await;
            runs.remove(&execution_id);
            result
        });

        Ok(RunHandle {
            execution_id,
            approvals: ApprovalHandle::new(execution_id, sender),
            cancel,
            join,
        })
    }
}

impl<R: WorkflowRepository + 'static> WorkflowExecutor for DagExecutor<R> {
    async fn execute(
        &self,
        plan: Arc<WorkflowPlan>,
        variables: BTreeMap<String, Value>,
    ) -> Result<WorkflowExecutionResult, ExecutorError> {
        self.start(plan, variables).await?.wait().await
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .runs
            .get(&execution_id)
            .map(|t| t.value().clone())
            .ok_or(ExecutorError::RunFinished(execution_id))?;
        tracing::info!(execution_id = %execution_id, "cancellation requested");
        token.cancel();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// What a worker hands back to the scheduling loop.
struct WorkerOutcome {
    idx: usize,
    attempt: u32,
    elapsed: Duration,
    outcome: Result<Value, TaskError>,
}

/// One executor call bounded by the task timeout and the run's cancellation.
async fn run_attempt(
    executor: Arc<dyn TaskExecutor>,
    request: TaskRequest,
    cancel: CancellationToken,
) -> Result<Value, TaskError> {
    let timeout = request.timeout;
    let attempt_token = cancel.child_token();
    let call = AssertUnwindSafe(executor.execute(request, attempt_token.clone())).catch_unwind();
    tokio::pin!(call);

    let interrupted = tokio::select! {
        out = &mut call => {
            return out.unwrap_or_else(|panic| Err(TaskError::Failed(panic_message(panic.as_ref()))));
        }
        _ = cancel.cancelled() => TaskError::Cancelled,
        _ = sleep(timeout) => {
            attempt_token.cancel();
            TaskError::Timeout { timeout_ms: millis(timeout) }
        }
    };

    // Give the executor a chance to observe the token and clean up.
    let _ = tokio::time::timeout(CANCEL_GRACE, &mut call).await;
    Err(interrupted)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("executor panicked: {detail}")
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// RunLoop
// ---------------------------------------------------------------------------

enum Readiness {
    Wait,
    Ready,
    /// Skip, with the failed or rejected tasks behind the cascade.
    Skip(SkipReason, BTreeSet<usize>),
}

enum Quiescence {
    /// Something is still running, waiting or scheduled.
    Busy,
    /// State changed without a dispatch; schedule again.
    Progressed,
    Done,
}

/// Owns all mutable state of one run.
struct RunLoop<R: WorkflowRepository> {
    plan: Arc<WorkflowPlan>,
    repo: Arc<R>,
    events: EventBus,
    execution_id: Uuid,
    result: WorkflowExecutionResult,
    states: Vec<TaskRuntimeState>,
    context: RunContext,
    selections: Vec<Option<BranchSelection>>,
    workers: JoinSet<WorkerOutcome>,
    semaphore: Arc<Semaphore>,
    gate: ApprovalGate,
    signals: mpsc::UnboundedReceiver<ApprovalSignal>,
    signals_open: bool,
    run_token: CancellationToken,
    /// Child of `run_token`; also cancelled on workflow timeout.
    worker_token: CancellationToken,
    started: Instant,
    deadline: Instant,
    abort_reason: Option<String>,
    unhandled_rejection: Option<String>,
    cancelled: bool,
    timed_out: bool,
}

impl<R: WorkflowRepository + 'static> RunLoop<R> {
    fn new(
        plan: Arc<WorkflowPlan>,
        repo: Arc<R>,
        events: EventBus,
        result: WorkflowExecutionResult,
        context: RunContext,
        signals: mpsc::UnboundedReceiver<ApprovalSignal>,
        run_token: CancellationToken,
    ) -> Self {
        let started = Instant::now();
        Self {
            execution_id: result.id,
            states: plan
                .tasks
                .iter()
                .map(|t| TaskRuntimeState::new(t.name.clone()))
                .collect(),
            selections: vec![None; plan.len()],
            semaphore: Arc::new(Semaphore::new(plan.degree_of_parallelism.max(1))),
            deadline: started + plan.workflow_timeout,
            worker_token: run_token.child_token(),
            plan,
            repo,
            events,
            result,
            context,
            workers: JoinSet::new(),
            gate: ApprovalGate::new(),
            signals,
            signals_open: true,
            run_token,
            started,
            abort_reason: None,
            unhandled_rejection: None,
            cancelled: false,
            timed_out: false,
        }
    }

    async fn run(mut self) -> WorkflowExecutionResult {
        loop {
            self.schedule().await;
            match self.quiescence().await {
                Quiescence::Done => break,
                Quiescence::Progressed => continue,
                Quiescence::Busy => {}
            }

            let wake = self.next_wake();
            tokio::select! {
                biased;

                _ = self.run_token.cancelled(), if !self.cancelled => self.on_cancel(),
                _ = sleep_until(self.deadline), if !self.cancelled && !self.timed_out => {
                    self.on_workflow_timeout();
                }
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.on_joined(joined).await;
                }
                signal = self.signals.recv(), if self.signals_open => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => self.signals_open = false,
                },
                _ = sleep_until(wake.unwrap_or(self.deadline)), if wake.is_some() => {
                    self.on_timer().await;
                }
                else => self.abort("scheduler has nothing left to wait on".to_string()),
            }
        }
        self.finalize().await
    }

    fn stopping(&self) -> bool {
        self.cancelled || self.timed_out || self.abort_reason.is_some()
    }

    // -----------------------------------------------------------------------
    // Readiness and dispatch
    // -----------------------------------------------------------------------

    /// Resolve pending tasks to a fixpoint, then dispatch what is ready.
    async fn schedule(&mut self) {
        if self.stopping() {
            return;
        }
        let plan = Arc::clone(&self.plan);
        loop {
            let mut progressed = false;
            for &idx in &plan.topological_order {
                if self.states[idx].status != TaskStatus::Pending {
                    continue;
                }
                match self.readiness(idx) {
                    Readiness::Wait => {}
                    Readiness::Skip(reason, root_causes) => {
                        self.states[idx].root_causes = root_causes;
                        self.skip_task(idx, reason).await;
                        progressed = true;
                    }
                    Readiness::Ready if plan.tasks[idx].approval.is_some() => {
                        self.suspend_for_approval(idx).await;
                        progressed = true;
                    }
                    Readiness::Ready => {}
                }
            }
            if !progressed {
                break;
            }
        }
        self.dispatch();
    }

    fn readiness(&self, idx: usize) -> Readiness {
        let task = &self.plan.tasks[idx];
        if task.is_compensation() && !self.states[idx].triggered {
            return Readiness::Wait;
        }

        // Trigger sources, direct or transitive, release on failure or
        // rejection; runOnFailureOf entries only on failure.
        let tolerates = |cause: usize| {
            task.trigger_sources.contains(&cause)
                || (self.states[cause].status == TaskStatus::Failed
                    && task.tolerated_failures.contains(&cause))
        };

        let mut cascade = None;
        let mut root_causes = BTreeSet::new();
        let mut other_cause = false;
        for &up in &task.upstream {
            let upstream = &self.states[up];
            if !upstream.is_terminal() {
                return Readiness::Wait;
            }
            let reason = match upstream.status {
                TaskStatus::Completed => {
                    let not_taken = self.branch_not_taken(up, idx);
                    other_cause |= not_taken;
                    not_taken.then_some(SkipReason::BranchNotTaken)
                }
                TaskStatus::Skipped => match upstream.skip_reason {
                    Some(SkipReason::ErrorPolicy) => None,
                    _ if !upstream.root_causes.is_empty()
                        && upstream.root_causes.iter().all(|&c| tolerates(c)) =>
                    {
                        None
                    }
                    _ => {
                        if upstream.root_causes.is_empty() {
                            other_cause = true;
                        }
                        root_causes.extend(upstream.root_causes.iter().copied());
                        Some(SkipReason::UpstreamSkipped)
                    }
                },
                TaskStatus::Rejected if tolerates(up) => None,
                TaskStatus::Rejected => {
                    root_causes.insert(up);
                    Some(SkipReason::ApprovalRejected)
                }
                TaskStatus::Failed if tolerates(up) => None,
                TaskStatus::Failed => {
                    root_causes.insert(up);
                    Some(SkipReason::UpstreamFailed)
                }
                _ => None,
            };
            cascade = cascade.or(reason);
        }
        if let Some(reason) = cascade {
            if other_cause {
                root_causes.clear();
            }
            return Readiness::Skip(reason, root_causes);
        }

        if let Some(condition) = &task.condition
            && !condition.evaluate_bool(&self.context)
        {
            return Readiness::Skip(SkipReason::ConditionFalse, BTreeSet::new());
        }
        Readiness::Ready
    }

    /// Whether `owner` routed away from `target`. No match keeps the natural edge.
    fn branch_not_taken(&self, owner: usize, target: usize) -> bool {
        if !self.plan.tasks[target].branch_owners.contains(&owner) {
            return false;
        }
        match self.selections[owner].as_ref().and_then(|s| s.target()) {
            Some(selected) => selected != self.plan.tasks[target].name,
            None => false,
        }
    }

    fn dispatch(&mut self) {
        let plan = Arc::clone(&self.plan);
        let now = Instant::now();
        for &idx in &plan.topological_order {
            let state = &self.states[idx];
            let eligible = match state.status {
                TaskStatus::Pending => {
                    plan.tasks[idx].approval.is_none()
                        && matches!(self.readiness(idx), Readiness::Ready)
                }
                TaskStatus::Approved => true,
                TaskStatus::Failed => state.retry_at.is_some_and(|at| at <= now),
                _ => false,
            };
            if !eligible {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                tracing::debug!(
                    execution_id = %self.execution_id,
                    "parallelism limit reached, deferring dispatch"
                );
                break;
            };
            self.spawn_attempt(idx, permit);
        }
    }

    fn spawn_attempt(&mut self, idx: usize, permit: OwnedSemaphorePermit) {
        let plan = Arc::clone(&self.plan);
        let task = &plan.tasks[idx];
        if !self.set_status(idx, TaskStatus::Running) {
            return;
        }
        let attempt = self.states[idx].attempts;

        let request = TaskRequest {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            operation: task.operation.clone(),
            specification: task.specification.clone(),
            parameters: task.parameters.render(&self.context),
            agent: task.agent.clone(),
            attempt,
            timeout: task.timeout,
        };

        tracing::info!(
            execution_id = %self.execution_id,
            task = %task.name,
            task_type = %task.task_type,
            attempt,
            "task started"
        );
        self.events.publish(WorkflowEvent::TaskStarted {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            attempt,
        });

        let executor = Arc::clone(&task.executor);
        let cancel = self.worker_token.clone();
        self.workers.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = run_attempt(executor, request, cancel).await;
            WorkerOutcome {
                idx,
                attempt,
                elapsed: started.elapsed(),
                outcome,
            }
        });
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    async fn on_joined(&mut self, joined: Result<WorkerOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(execution_id = %self.execution_id, error = %e, "task worker lost");
                return;
            }
        };
        match outcome.outcome {
            Ok(output) => {
                self.on_success(outcome.idx, outcome.attempt, outcome.elapsed, output)
                    .await;
            }
            Err(err) => self.on_failure(outcome.idx, outcome.attempt, err).await,
        }
    }

    async fn on_success(&mut self, idx: usize, attempt: u32, elapsed: Duration, output: Value) {
        let plan = Arc::clone(&self.plan);
        let task = &plan.tasks[idx];

        // Published before the task turns terminal.
        let stored = self.context.publish_result(&task.name, output);
        self.states[idx].output = Some(stored);

        if !task.branches.is_empty() {
            let selection = select_branch(&task.branches, &self.context);
            if let BranchSelection::Ambiguous(targets) = &selection {
                let message = format!(
                    "conditional branches are not mutually exclusive: {} all matched",
                    targets.join(", ")
                );
                self.fail_task(idx, attempt, message.clone(), false);
                self.record_task(idx).await;
                self.abort(format!("task '{}' failed: {message}", task.name));
                return;
            }
            tracing::debug!(
                execution_id = %self.execution_id,
                task = %task.name,
                selected = ?selection.target(),
                "branch evaluated"
            );
            self.selections[idx] = Some(selection);
        }

        if !self.set_status(idx, TaskStatus::Completed) {
            return;
        }
        tracing::info!(
            execution_id = %self.execution_id,
            task = %task.name,
            attempt,
            duration_ms = millis(elapsed),
            "task completed"
        );
        self.events.publish(WorkflowEvent::TaskCompleted {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            attempt,
            duration_ms: millis(elapsed),
        });
        self.record_task(idx).await;
    }

    async fn on_failure(&mut self, idx: usize, attempt: u32, err: TaskError) {
        let plan = Arc::clone(&self.plan);
        let task = &plan.tasks[idx];

        if !self.stopping()
            && err.is_retryable()
            && let Some(policy) = task.policy.retry_policy()
            && RetryController::should_retry(policy, attempt)
        {
            let delay = RetryController::next_delay(attempt, policy);
            self.fail_task(idx, attempt, err.to_string(), true);
            self.states[idx].retry_at = Some(Instant::now() + delay);
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %task.name,
                attempt,
                max_attempts = RetryController::max_attempts(policy),
                delay_ms = millis(delay),
                error = %err,
                "task failed, retry scheduled"
            );
            return;
        }

        self.fail_task(idx, attempt, err.to_string(), false);
        if self.stopping() {
            self.record_task(idx).await;
            return;
        }

        match &task.policy {
            ResolvedPolicy::Skip => {
                self.skip_task(idx, SkipReason::ErrorPolicy).await;
            }
            ResolvedPolicy::TriggerTask(target) => {
                self.states[idx].compensated = true;
                self.record_task(idx).await;
                self.dispatch_trigger(idx, target);
            }
            ResolvedPolicy::Abort | ResolvedPolicy::Retry(_) => {
                self.record_task(idx).await;
                self.abort(format!("task '{}' failed: {err}", task.name));
            }
        }
    }

    /// Move a running task to `Failed` and announce it.
    fn fail_task(&mut self, idx: usize, attempt: u32, error: String, will_retry: bool) {
        if !self.set_status(idx, TaskStatus::Failed) {
            return;
        }
        if !will_retry {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %self.states[idx].name,
                attempt,
                error = %error,
                "task failed"
            );
        }
        self.events.publish(WorkflowEvent::TaskFailed {
            execution_id: self.execution_id,
            task_name: self.states[idx].name.clone(),
            attempt,
            error: error.clone(),
            will_retry,
        });
        self.states[idx].last_error = Some(error);
    }

    /// Release a compensation task. A second source is a no-op.
    fn dispatch_trigger(&mut self, source: usize, target: &str) {
        let Some(target_idx) = self.plan.index_of(target) else {
            return;
        };
        let source_name = &self.plan.tasks[source].name;
        if self.states[target_idx].triggered {
            tracing::debug!(
                execution_id = %self.execution_id,
                source = %source_name,
                trigger = target,
                "trigger task already dispatched"
            );
            return;
        }
        self.states[target_idx].triggered = true;
        tracing::info!(
            execution_id = %self.execution_id,
            source = %source_name,
            trigger = target,
            "trigger task dispatched"
        );
        self.events.publish(WorkflowEvent::TriggerDispatched {
            execution_id: self.execution_id,
            source_task: source_name.clone(),
            trigger_task: target.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    async fn suspend_for_approval(&mut self, idx: usize) {
        let plan = Arc::clone(&self.plan);
        let task = &plan.tasks[idx];
        let Some(approval) = &task.approval else {
            return;
        };
        if !self.set_status(idx, TaskStatus::AwaitingApproval) {
            return;
        }

        self.gate
            .suspend(&task.name, approval.timeout.map(|t| Instant::now() + t));

        let requested_at = Utc::now();
        let pending = PendingApproval {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            message: approval.message.clone(),
            approvers: approval.approvers.clone(),
            requested_at,
            expires_at: approval
                .timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| requested_at + t),
        };
        if let Err(e) = self.repo.request_approval(&pending).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %task.name,
                error = %e,
                "failed to persist pending approval"
            );
        }
        self.persist_task(idx).await;

        tracing::info!(
            execution_id = %self.execution_id,
            task = %task.name,
            "task awaiting approval"
        );
        self.events.publish(WorkflowEvent::TaskAwaitingApproval {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            message: approval.message.clone(),
        });
    }

    async fn on_signal(&mut self, signal: ApprovalSignal) {
        let Some(idx) = self.plan.index_of(&signal.task_name) else {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %signal.task_name,
                "approval signal for unknown task ignored"
            );
            return;
        };
        if self.stopping() || !self.gate.is_waiting(&signal.task_name) {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %signal.task_name,
                status = %self.states[idx].status,
                "approval signal for task not awaiting approval ignored"
            );
            return;
        }
        self.decide(idx, signal).await;
    }

    async fn decide(&mut self, idx: usize, signal: ApprovalSignal) {
        let plan = Arc::clone(&self.plan);
        let task = &plan.tasks[idx];
        self.gate.resolve(&task.name);

        let record = ApprovalRecord {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            decision: signal.decision,
            decided_by: signal.decided_by.clone(),
            comment: signal.comment.clone(),
            decided_at: Utc::now(),
        };
        if let Err(e) = self.repo.record_approval(&record).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %task.name,
                error = %e,
                "failed to persist approval decision"
            );
        }

        tracing::info!(
            execution_id = %self.execution_id,
            task = %task.name,
            decision = %signal.decision,
            decided_by = signal.decided_by.as_deref().unwrap_or("-"),
            "approval decided"
        );
        self.events.publish(WorkflowEvent::TaskApprovalDecided {
            execution_id: self.execution_id,
            task_name: task.name.clone(),
            decision: signal.decision,
        });

        match signal.decision {
            ApprovalDecision::Approved => {
                if self.set_status(idx, TaskStatus::Approved) {
                    self.persist_task(idx).await;
                }
            }
            ApprovalDecision::Rejected => {
                if !self.set_status(idx, TaskStatus::Rejected) {
                    return;
                }
                self.states[idx].last_error = Some(
                    signal
                        .comment
                        .map(|c| format!("approval rejected: {c}"))
                        .unwrap_or_else(|| "approval rejected".to_string()),
                );
                self.record_task(idx).await;
                match &task.policy {
                    ResolvedPolicy::TriggerTask(target) => {
                        self.states[idx].compensated = true;
                        self.dispatch_trigger(idx, target);
                    }
                    _ => {
                        self.unhandled_rejection.get_or_insert_with(|| {
                            format!("approval for task '{}' was rejected", task.name)
                        });
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers and stop signals
    // -----------------------------------------------------------------------

    /// Earliest retry or approval deadline worth waking for.
    fn next_wake(&self) -> Option<Instant> {
        if self.stopping() {
            return None;
        }
        let retry = if self.semaphore.available_permits() > 0 {
            self.states
                .iter()
                .filter(|s| s.status == TaskStatus::Failed)
                .filter_map(|s| s.retry_at)
                .min()
        } else {
            None
        };
        [retry, self.gate.next_deadline()].into_iter().flatten().min()
    }

    async fn on_timer(&mut self) {
        for name in self.gate.expired(Instant::now()) {
            let Some(idx) = self.plan.index_of(&name) else {
                continue;
            };
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %name,
                "approval timed out"
            );
            self.decide(
                idx,
                ApprovalSignal {
                    task_name: name,
                    decision: ApprovalDecision::Rejected,
                    decided_by: None,
                    comment: Some("approval timed out".to_string()),
                },
            )
            .await;
        }
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        tracing::info!(
            execution_id = %self.execution_id,
            in_flight = self.workers.len(),
            "run cancelled"
        );
        self.worker_token.cancel();
    }

    fn on_workflow_timeout(&mut self) {
        self.timed_out = true;
        tracing::error!(
            execution_id = %self.execution_id,
            timeout_ms = millis(self.plan.workflow_timeout),
            in_flight = self.workers.len(),
            "workflow timed out"
        );
        self.worker_token.cancel();
    }

    /// Stop dispatching; in-flight tasks finish. The first reason wins.
    fn abort(&mut self, reason: String) {
        if self.abort_reason.is_none() {
            tracing::error!(
                execution_id = %self.execution_id,
                reason = %reason,
                "run aborted"
            );
            self.abort_reason = Some(reason);
        }
    }

    async fn quiescence(&mut self) -> Quiescence {
        if !self.workers.is_empty() {
            return Quiescence::Busy;
        }
        if self.stopping() {
            return Quiescence::Done;
        }
        let retry_pending = self
            .states
            .iter()
            .any(|s| s.status == TaskStatus::Failed && s.retry_at.is_some());
        if !self.gate.is_empty() || retry_pending {
            return Quiescence::Busy;
        }
        if self.states.iter().all(TaskRuntimeState::is_terminal) {
            return Quiescence::Done;
        }

        // Nothing can trigger a compensation task any more.
        let plan = Arc::clone(&self.plan);
        let mut released = false;
        for &idx in &plan.topological_order {
            if plan.tasks[idx].is_compensation()
                && !self.states[idx].triggered
                && self.states[idx].status == TaskStatus::Pending
            {
                self.skip_task(idx, SkipReason::NotTriggered).await;
                released = true;
            }
        }
        if released {
            return Quiescence::Progressed;
        }

        let blocked: Vec<&str> = self
            .states
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.name.as_str())
            .collect();
        let reason = format!("run stalled; blocked tasks: {}", blocked.join(", "));
        self.abort(reason);
        Quiescence::Done
    }

    // -----------------------------------------------------------------------
    // State helpers
    // -----------------------------------------------------------------------

    fn set_status(&mut self, idx: usize, to: TaskStatus) -> bool {
        match self.states[idx].transition(to) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(execution_id = %self.execution_id, error = %e, "invalid task transition");
                false
            }
        }
    }

    async fn skip_task(&mut self, idx: usize, reason: SkipReason) {
        if let Err(e) = self.states[idx].skip(reason) {
            tracing::warn!(execution_id = %self.execution_id, error = %e, "invalid task transition");
            return;
        }
        tracing::debug!(
            execution_id = %self.execution_id,
            task = %self.states[idx].name,
            reason = %reason,
            "task skipped"
        );
        self.events.publish(WorkflowEvent::TaskSkipped {
            execution_id: self.execution_id,
            task_name: self.states[idx].name.clone(),
            reason,
        });
        self.record_task(idx).await;
    }

    /// Save the current task record without appending it to the result.
    async fn persist_task(&mut self, idx: usize) {
        let record = self.states[idx].to_result(self.execution_id);
        if let Err(e) = self.repo.save_task_execution(&record).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                task = %record.task_name,
                error = %e,
                "failed to persist task record"
            );
        }
    }

    /// Append a terminal task record to the result (once) and save it.
    async fn record_task(&mut self, idx: usize) {
        if self.states[idx].recorded {
            return;
        }
        self.states[idx].recorded = true;
        self.persist_task(idx).await;
        self.result
            .tasks
            .push(self.states[idx].to_result(self.execution_id));
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    async fn finalize(mut self) -> WorkflowExecutionResult {
        let plan = Arc::clone(&self.plan);
        for &idx in &plan.topological_order {
            match self.states[idx].status {
                TaskStatus::Pending | TaskStatus::AwaitingApproval | TaskStatus::Approved => {
                    let reason = if plan.tasks[idx].is_compensation() && !self.states[idx].triggered
                    {
                        SkipReason::NotTriggered
                    } else {
                        SkipReason::RunAborted
                    };
                    self.gate.resolve(&plan.tasks[idx].name);
                    if let Err(e) = self.states[idx].skip(reason) {
                        tracing::warn!(execution_id = %self.execution_id, error = %e, "invalid task transition");
                        continue;
                    }
                    self.events.publish(WorkflowEvent::TaskSkipped {
                        execution_id: self.execution_id,
                        task_name: plan.tasks[idx].name.clone(),
                        reason,
                    });
                }
                TaskStatus::Running => {
                    if self.set_status(idx, TaskStatus::Failed) {
                        self.states[idx].last_error =
                            Some("task did not report a result".to_string());
                    }
                }
                TaskStatus::Failed => self.states[idx].retry_at = None,
                TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Rejected => {}
            }
        }

        if let Err(e) = self.repo.clear_pending_approvals(&self.execution_id).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                error = %e,
                "failed to clear pending approvals"
            );
        }

        for &idx in &plan.topological_order {
            self.record_task(idx).await;
        }

        let (status, error) = if self.cancelled {
            (ExecutionStatus::Cancelled, Some("run was cancelled".to_string()))
        } else if self.timed_out {
            (
                ExecutionStatus::Failed,
                Some(format!(
                    "workflow timed out after {}ms",
                    millis(plan.workflow_timeout)
                )),
            )
        } else if let Some(reason) = self.abort_reason.take() {
            (ExecutionStatus::Failed, Some(reason))
        } else if let Some(reason) = self.unhandled_rejection.take() {
            (ExecutionStatus::Failed, Some(reason))
        } else {
            (ExecutionStatus::Completed, None)
        };

        self.result.status = status;
        self.result.error = error;
        self.result.completed_at = Some(Utc::now());
        if let Err(e) = self.repo.save_execution(&self.result).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                error = %e,
                "failed to persist final execution record"
            );
        }

        let duration_ms = millis(self.started.elapsed());
        tracing::info!(
            execution_id = %self.execution_id,
            workflow = %plan.name,
            status = %status,
            duration_ms,
            completed = self.result.count(TaskStatus::Completed),
            failed = self.result.count(TaskStatus::Failed),
            skipped = self.result.count(TaskStatus::Skipped),
            "workflow run finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            execution_id: self.execution_id,
            status,
            duration_ms,
        });
        self.result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::plan::compile;
    use crate::workflow::task_executor::{ExecutorRegistry, TaskFuture};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weaver_types::config::EngineConfig;
    use weaver_types::workflow::WorkflowDefinition;

    /// Shared call log and concurrency gauge.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<HashMap<String, u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn hit(&self, task: &str) -> u32 {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(task.to_string()).or_insert(0);
            *n += 1;
            *n
        }

        fn calls(&self, task: &str) -> u32 {
            self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
        }
    }

    #[derive(Clone, Copy)]
    enum Kind {
        /// Returns its parameters.
        Echo,
        /// Fails with `parameters.message`.
        Fail,
        /// Fails `parameters.failTimes` times, then succeeds.
        Flaky,
        /// Sleeps `parameters.ms` (default 50), honouring cancellation.
        Slow,
    }

    struct Scripted {
        kind: Kind,
        recorder: Arc<Recorder>,
    }

    impl TaskExecutor for Scripted {
        fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskFuture<'_> {
            Box::pin(async move {
                let n = self.recorder.hit(&request.task_name);
                match self.kind {
                    Kind::Echo => Ok(request.parameters),
                    Kind::Fail => Err(TaskError::Failed(
                        request.parameters["message"]
                            .as_str()
                            .unwrap_or("boom")
                            .to_string(),
                    )),
                    Kind::Flaky => {
                        let fail_times = request.parameters["failTimes"].as_u64().unwrap_or(0);
                        if u64::from(n) <= fail_times {
                            Err(TaskError::Failed(format!("attempt {n} failed")))
                        } else {
                            Ok(json!({ "attempt": n }))
                        }
                    }
                    Kind::Slow => {
                        let ms = request.parameters["ms"].as_u64().unwrap_or(50);
                        let now = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
                        self.recorder.peak.fetch_max(now, Ordering::SeqCst);
                        let out = tokio::select! {
                            _ = sleep(Duration::from_millis(ms)) => Ok(request.parameters),
                            _ = cancel.cancelled() => Err(TaskError::Cancelled),
                        };
                        self.recorder.running.fetch_sub(1, Ordering::SeqCst);
                        out
                    }
                }
            })
        }
    }

    struct Harness {
        repo: Arc<InMemoryWorkflowRepository>,
        executor: DagExecutor<InMemoryWorkflowRepository>,
        registry: ExecutorRegistry,
        recorder: Arc<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            let recorder = Arc::new(Recorder::default());
            let mut registry = ExecutorRegistry::new();
            for (name, kind) in [
                ("Echo", Kind::Echo),
                ("Fail", Kind::Fail),
                ("Flaky", Kind::Flaky),
                ("Slow", Kind::Slow),
            ] {
                registry.register(
                    name,
                    Arc::new(Scripted {
                        kind,
                        recorder: Arc::clone(&recorder),
                    }),
                );
            }
            let repo = Arc::new(InMemoryWorkflowRepository::new());
            Self {
                executor: DagExecutor::new(Arc::clone(&repo), EventBus::default()),
                repo,
                registry,
                recorder,
            }
        }

        fn plan(&self, value: Value) -> Arc<WorkflowPlan> {
            let def: WorkflowDefinition = serde_json::from_value(value).unwrap();
            Arc::new(compile(&def, &self.registry, &EngineConfig::default()).unwrap())
        }

        async fn run(&self, value: Value) -> WorkflowExecutionResult {
            self.executor
                .execute(self.plan(value), BTreeMap::new())
                .await
                .unwrap()
        }
    }

    fn status(result: &WorkflowExecutionResult, task: &str) -> TaskStatus {
        result.task(task).unwrap().status
    }

    fn skip_reason(result: &WorkflowExecutionResult, task: &str) -> Option<SkipReason> {
        result.task(task).unwrap().skip_reason
    }

    async fn wait_for_gate(rx: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>, task: &str) {
        loop {
            if let WorkflowEvent::TaskAwaitingApproval { task_name, .. } = rx.recv().await.unwrap()
                && task_name == task
            {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_runs_in_parallel() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "FanOut",
                "configuration": { "degreeOfParallelism": 2 },
                "tasks": [
                    { "name": "TaskAlpha", "type": "Slow" },
                    { "name": "TaskBravo", "type": "Slow", "dependencies": ["TaskAlpha"] },
                    { "name": "TaskCharlie", "type": "Slow", "dependencies": ["TaskAlpha"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.count(TaskStatus::Completed), 3);
        assert_eq!(result.tasks[0].task_name, "TaskAlpha");
        assert_eq!(h.recorder.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_bound_holds() {
        let h = Harness::new();
        let tasks: Vec<Value> = ["TaskOne", "TaskTwo", "TaskThree", "TaskFour", "TaskFive"]
            .iter()
            .map(|n| json!({ "name": n, "type": "Slow" }))
            .collect();
        let result = h
            .run(json!({
                "name": "Bounded",
                "configuration": { "degreeOfParallelism": 2 },
                "tasks": tasks
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(h.recorder.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let h = Harness::new();
        let mut rx = h.executor.event_bus().subscribe();
        let result = h
            .run(json!({
                "name": "Retrying",
                "tasks": [{
                    "name": "ChargeCard", "type": "Flaky",
                    "execution": { "parameters": { "failTimes": 2 }, "timeoutMilliseconds": 5000 },
                    "errorHandling": {
                        "strategy": "Retry",
                        "retryPolicy": { "maxRetries": 2, "backoffStrategy": "Fixed", "delayMilliseconds": 1000 }
                    }
                }]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let charge = result.task("ChargeCard").unwrap();
        assert_eq!(charge.status, TaskStatus::Completed);
        assert_eq!(charge.attempts, 3);
        assert_eq!(charge.output, Some(json!({ "attempt": 3 })));

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::TaskFailed { will_retry, .. } = event {
                assert!(will_retry);
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_aborts() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Retrying",
                "tasks": [
                    {
                        "name": "ChargeCard", "type": "Flaky",
                        "execution": { "parameters": { "failTimes": 5 }, "timeoutMilliseconds": 5000 },
                        "errorHandling": {
                            "strategy": "Retry",
                            "retryPolicy": { "maxRetries": 1, "delayMilliseconds": 10 }
                        }
                    },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ChargeCard"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        let charge = result.task("ChargeCard").unwrap();
        assert_eq!(charge.status, TaskStatus::Failed);
        assert_eq!(charge.attempts, 2);
        assert_eq!(charge.error.as_deref(), Some("attempt 2 failed"));
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::RunAborted));
        assert_eq!(h.recorder.calls("ShipOrder"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_lets_dependents_run() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Skipping",
                "tasks": [
                    { "name": "WarmCache", "type": "Fail",
                      "execution": { "parameters": { "message": "cache offline" } },
                      "errorHandling": { "strategy": "Skip" } },
                    { "name": "ServeTraffic", "type": "Echo", "dependencies": ["WarmCache"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let warm = result.task("WarmCache").unwrap();
        assert_eq!(warm.status, TaskStatus::Skipped);
        assert_eq!(warm.skip_reason, Some(SkipReason::ErrorPolicy));
        assert_eq!(warm.error.as_deref(), Some("cache offline"));
        assert_eq!(status(&result, "ServeTraffic"), TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_downstream() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Aborting",
                "tasks": [
                    { "name": "FetchOrders", "type": "Fail" },
                    { "name": "FetchStock", "type": "Echo" },
                    { "name": "ShipOrders", "type": "Echo", "dependencies": ["FetchOrders", "FetchStock"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("FetchOrders"));
        assert_eq!(status(&result, "FetchOrders"), TaskStatus::Failed);
        assert_eq!(status(&result, "FetchStock"), TaskStatus::Completed);
        assert_eq!(skip_reason(&result, "ShipOrders"), Some(SkipReason::RunAborted));
        assert_eq!(h.recorder.calls("ShipOrders"), 0);
        assert_eq!(result.tasks.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_dispatched_once() {
        let h = Harness::new();
        let trigger = json!({ "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } });
        let result = h
            .run(json!({
                "name": "Compensating",
                "tasks": [
                    { "name": "ChargeCard", "type": "Fail", "errorHandling": trigger.clone() },
                    { "name": "ReserveStock", "type": "Fail", "errorHandling": trigger.clone() },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ChargeCard"] },
                    { "name": "NotifyOps", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(h.recorder.calls("NotifyOps"), 1);
        assert_eq!(status(&result, "NotifyOps"), TaskStatus::Completed);
        assert_eq!(status(&result, "ChargeCard"), TaskStatus::Failed);
        assert_eq!(status(&result, "ReserveStock"), TaskStatus::Failed);
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::UpstreamFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_untriggered_compensation_is_skipped() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Compensating",
                "tasks": [
                    { "name": "ChargeCard", "type": "Echo",
                      "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "RefundCard" } } },
                    { "name": "RefundCard", "type": "Echo" },
                    { "name": "AuditRefund", "type": "Echo", "dependencies": ["RefundCard"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(skip_reason(&result, "RefundCard"), Some(SkipReason::NotTriggered));
        assert_eq!(skip_reason(&result, "AuditRefund"), Some(SkipReason::UpstreamSkipped));
        assert_eq!(h.recorder.calls("RefundCard"), 0);
    }

    fn notify_on_failure() -> Value {
        json!({ "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } })
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_failure_of_direct_dependency() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Checkout",
                "tasks": [
                    { "name": "ChargeCard", "type": "Fail", "errorHandling": notify_on_failure() },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ChargeCard"] },
                    { "name": "ReleaseHold", "type": "Echo", "dependencies": ["ChargeCard"],
                      "runOnFailureOf": ["ChargeCard"] },
                    { "name": "NotifyOps", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(status(&result, "ReleaseHold"), TaskStatus::Completed);
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::UpstreamFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_failure_of_transitive_dependency() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Checkout",
                "tasks": [
                    { "name": "ChargeCard", "type": "Fail", "errorHandling": notify_on_failure() },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ChargeCard"] },
                    { "name": "CleanUp", "type": "Echo", "dependencies": ["ShipOrder"],
                      "runOnFailureOf": ["ChargeCard"] },
                    { "name": "ArchiveOrder", "type": "Echo", "dependencies": ["ShipOrder"] },
                    { "name": "NotifyOps", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::UpstreamFailed));
        assert_eq!(status(&result, "CleanUp"), TaskStatus::Completed);
        assert_eq!(h.recorder.calls("CleanUp"), 1);
        assert_eq!(skip_reason(&result, "ArchiveOrder"), Some(SkipReason::UpstreamSkipped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_failure_of_does_not_cover_other_skips() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Checkout",
                "variables": { "GiftWrap": false },
                "tasks": [
                    { "name": "ChargeCard", "type": "Fail", "errorHandling": notify_on_failure() },
                    { "name": "WrapGift", "type": "Echo", "dependencies": ["ChargeCard"],
                      "runOnFailureOf": ["ChargeCard"],
                      "executionCondition": "$[Variables('GiftWrap')]" },
                    { "name": "CleanUp", "type": "Echo", "dependencies": ["WrapGift"],
                      "runOnFailureOf": ["ChargeCard"] },
                    { "name": "NotifyOps", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(skip_reason(&result, "WrapGift"), Some(SkipReason::ConditionFalse));
        assert_eq!(skip_reason(&result, "CleanUp"), Some(SkipReason::UpstreamSkipped));
        assert_eq!(h.recorder.calls("CleanUp"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_target_downstream_of_source_runs() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Checkout",
                "tasks": [
                    { "name": "ChargeCard", "type": "Fail",
                      "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "RefundCard" } } },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ChargeCard"] },
                    { "name": "RefundCard", "type": "Echo", "dependencies": ["ShipOrder"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::UpstreamFailed));
        assert_eq!(status(&result, "RefundCard"), TaskStatus::Completed);
        assert_eq!(h.recorder.calls("RefundCard"), 1);
    }

    fn gated() -> Value {
        json!({
            "name": "Gated",
            "tasks": [
                { "name": "ReviewOrder", "type": "Echo",
                  "manualApproval": { "message": "Ship it?", "approvers": ["ops"] } },
                { "name": "ShipOrder", "type": "Echo", "dependencies": ["ReviewOrder"] },
                { "name": "AuditLog", "type": "Echo" }
            ]
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_releases_dependents() {
        let h = Harness::new();
        let mut rx = h.executor.event_bus().subscribe();
        let handle = h.executor.start(h.plan(gated()), BTreeMap::new()).await.unwrap();
        let id = handle.execution_id();

        wait_for_gate(&mut rx, "ReviewOrder").await;
        let pending = h.repo.get_pending_approvals(Some(&id)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.as_deref(), Some("Ship it?"));

        handle
            .approvals()
            .approve("ReviewOrder", Some("ops".to_string()))
            .unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(status(&result, "ReviewOrder"), TaskStatus::Completed);
        assert_eq!(status(&result, "ShipOrder"), TaskStatus::Completed);
        let approvals = h.repo.list_approvals(&id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].decision, ApprovalDecision::Approved);
        assert!(h.repo.get_pending_approvals(Some(&id)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_skips_dependents_and_fails_run() {
        let h = Harness::new();
        let mut rx = h.executor.event_bus().subscribe();
        let handle = h.executor.start(h.plan(gated()), BTreeMap::new()).await.unwrap();

        wait_for_gate(&mut rx, "ReviewOrder").await;
        handle
            .approvals()
            .reject("ReviewOrder", None, Some("out of stock".to_string()))
            .unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        let review = result.task("ReviewOrder").unwrap();
        assert_eq!(review.status, TaskStatus::Rejected);
        assert_eq!(review.error.as_deref(), Some("approval rejected: out of stock"));
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::ApprovalRejected));
        assert_eq!(status(&result, "AuditLog"), TaskStatus::Completed);
        assert_eq!(h.recorder.calls("ReviewOrder"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_releases_downstream_trigger_target() {
        let h = Harness::new();
        let mut rx = h.executor.event_bus().subscribe();
        let plan = h.plan(json!({
            "name": "Gated",
            "tasks": [
                { "name": "ReviewOrder", "type": "Echo",
                  "manualApproval": { "message": "Ship it?" },
                  "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "RestockItems" } } },
                { "name": "ShipOrder", "type": "Echo", "dependencies": ["ReviewOrder"] },
                { "name": "RestockItems", "type": "Echo", "dependencies": ["ShipOrder"] }
            ]
        }));
        let handle = h.executor.start(plan, BTreeMap::new()).await.unwrap();

        wait_for_gate(&mut rx, "ReviewOrder").await;
        handle.approvals().reject("ReviewOrder", None, None).unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::ApprovalRejected));
        assert_eq!(status(&result, "RestockItems"), TaskStatus::Completed);
        assert_eq!(h.recorder.calls("RestockItems"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_rejects() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Gated",
                "tasks": [
                    { "name": "ReviewOrder", "type": "Echo",
                      "manualApproval": { "timeoutMilliseconds": 1000 } },
                    { "name": "ShipOrder", "type": "Echo", "dependencies": ["ReviewOrder"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        let review = result.task("ReviewOrder").unwrap();
        assert_eq!(review.status, TaskStatus::Rejected);
        assert_eq!(review.error.as_deref(), Some("approval rejected: approval timed out"));
        assert_eq!(skip_reason(&result, "ShipOrder"), Some(SkipReason::ApprovalRejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_routes_to_single_target() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Routing",
                "tasks": [
                    { "name": "CheckStock", "type": "Echo",
                      "execution": { "parameters": { "level": 5 } },
                      "conditionalBranches": [
                          { "expression": "Results('CheckStock').level < 10", "taskName": "OrderMore" },
                          { "expression": "Results('CheckStock').level > 100", "taskName": "RunSale" },
                          { "expression": "true", "taskName": "ReportStock" }
                      ] },
                    { "name": "OrderMore", "type": "Echo",
                      "execution": { "parameters": { "have": "$[Results('CheckStock').level]" } } },
                    { "name": "RunSale", "type": "Echo" },
                    { "name": "ReportStock", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let order = result.task("OrderMore").unwrap();
        assert_eq!(order.status, TaskStatus::Completed);
        assert_eq!(order.output, Some(json!({ "have": 5 })));
        assert_eq!(skip_reason(&result, "RunSale"), Some(SkipReason::BranchNotTaken));
        assert_eq!(skip_reason(&result, "ReportStock"), Some(SkipReason::BranchNotTaken));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_branches_fail_owner() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Routing",
                "tasks": [
                    { "name": "CheckStock", "type": "Echo",
                      "execution": { "parameters": { "level": 5 } },
                      "conditionalBranches": [
                          { "expression": "Results('CheckStock').level < 10", "taskName": "OrderMore" },
                          { "expression": "Results('CheckStock').level < 20", "taskName": "AlertBuyer" }
                      ] },
                    { "name": "OrderMore", "type": "Echo" },
                    { "name": "AlertBuyer", "type": "Echo" }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        let check = result.task("CheckStock").unwrap();
        assert_eq!(check.status, TaskStatus::Failed);
        assert!(check.error.as_deref().unwrap().contains("OrderMore, AlertBuyer"));
        assert_eq!(h.recorder.calls("OrderMore"), 0);
        assert_eq!(h.recorder.calls("AlertBuyer"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_condition_cascades() {
        let h = Harness::new();
        let def = json!({
            "name": "Conditional",
            "variables": { "Enabled": false },
            "tasks": [
                { "name": "SendEmail", "type": "Echo", "executionCondition": "$[Variables('Enabled')]" },
                { "name": "LogDelivery", "type": "Echo", "dependencies": ["SendEmail"] }
            ]
        });

        let result = h.run(def.clone()).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(skip_reason(&result, "SendEmail"), Some(SkipReason::ConditionFalse));
        assert_eq!(skip_reason(&result, "LogDelivery"), Some(SkipReason::UpstreamSkipped));

        let overrides = BTreeMap::from([("Enabled".to_string(), json!(true))]);
        let result = h.executor.execute(h.plan(def), overrides).await.unwrap();
        assert_eq!(status(&result, "SendEmail"), TaskStatus::Completed);
        assert_eq!(status(&result, "LogDelivery"), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_override_rejected() {
        let h = Harness::new();
        let plan = h.plan(json!({
            "name": "Plain",
            "tasks": [{ "name": "SendEmail", "type": "Echo" }]
        }));
        let overrides = BTreeMap::from([("Missing".to_string(), json!(1))]);
        let err = h.executor.start(plan, overrides).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownVariable(ref n) if n == "Missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_marks_run_cancelled() {
        let h = Harness::new();
        let mut rx = h.executor.event_bus().subscribe();
        let handle = h
            .executor
            .start(
                h.plan(json!({
                    "name": "LongRunning",
                    "tasks": [
                        { "name": "CrunchNumbers", "type": "Slow", "execution": { "parameters": { "ms": 60000 } } },
                        { "name": "PublishReport", "type": "Echo", "dependencies": ["CrunchNumbers"] }
                    ]
                })),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        let id = handle.execution_id();

        while !matches!(rx.recv().await.unwrap(), WorkflowEvent::TaskStarted { .. }) {}
        assert_eq!(h.executor.active_runs(), vec![id]);
        h.executor.cancel(id).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        let crunch = result.task("CrunchNumbers").unwrap();
        assert_eq!(crunch.status, TaskStatus::Failed);
        assert_eq!(crunch.error.as_deref(), Some("task was cancelled"));
        assert_eq!(skip_reason(&result, "PublishReport"), Some(SkipReason::RunAborted));
        assert!(h.executor.active_runs().is_empty());
        assert!(matches!(
            h.executor.cancel(id).await,
            Err(ExecutorError::RunFinished(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_feeds_policy() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Timeouts",
                "tasks": [{
                    "name": "CrunchNumbers", "type": "Slow",
                    "execution": { "parameters": { "ms": 60000 }, "timeoutMilliseconds": 100 },
                    "errorHandling": { "strategy": "Skip" }
                }]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let crunch = result.task("CrunchNumbers").unwrap();
        assert_eq!(crunch.status, TaskStatus::Skipped);
        assert_eq!(crunch.error.as_deref(), Some("task timed out after 100ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_fails_run() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Timeouts",
                "configuration": { "timeoutMilliseconds": 1000 },
                "tasks": [
                    { "name": "QuickCheck", "type": "Echo" },
                    { "name": "CrunchNumbers", "type": "Slow",
                      "execution": { "parameters": { "ms": 60000 } },
                      "dependencies": ["QuickCheck"] },
                    { "name": "PublishReport", "type": "Echo", "dependencies": ["CrunchNumbers"] }
                ]
            }))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("workflow timed out after 1000ms"));
        assert_eq!(status(&result, "QuickCheck"), TaskStatus::Completed);
        assert_eq!(status(&result, "CrunchNumbers"), TaskStatus::Failed);
        assert_eq!(skip_reason(&result, "PublishReport"), Some(SkipReason::RunAborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_persisted() {
        let h = Harness::new();
        let result = h
            .run(json!({
                "name": "Persisted",
                "variables": { "Region": "eu" },
                "tasks": [
                    { "name": "FetchOrders", "type": "Echo",
                      "execution": { "parameters": { "region": "$[Variables('Region')]" } } },
                    { "name": "ShipOrders", "type": "Echo", "dependencies": ["FetchOrders"],
                      "execution": { "parameters": { "note": "ship to $[Results('FetchOrders').region]" } } }
                ]
            }))
            .await;

        assert_eq!(
            result.task("ShipOrders").unwrap().output,
            Some(json!({ "note": "ship to eu" }))
        );
        let saved = h.repo.get_execution(&result.id).await.unwrap().unwrap();
        assert_eq!(saved, result);
        let tasks = h.repo.list_task_executions(&result.id).await.unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.task_name.as_str()).collect();
        assert_eq!(names, vec!["FetchOrders", "ShipOrders"]);
    }
}
