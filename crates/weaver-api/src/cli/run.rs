//! `weaver run`: execute a workflow with live progress and interactive approvals.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::{Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use weaver_core::event::{EventBus, RunEvents};
use weaver_core::repository::memory::InMemoryWorkflowRepository;
use weaver_core::repository::workflow::WorkflowRepository;
use weaver_core::workflow::approval::ApprovalHandle;
use weaver_core::workflow::executor::DagExecutor;
use weaver_types::event::WorkflowEvent;
use weaver_types::execution::{
    ApprovalDecision, ExecutionStatus, TaskStatus, WorkflowExecutionResult,
};

use super::validate::load_plan;
use super::{elapsed, format_task_status, truncate};
use crate::state::AppState;

const EVENT_CAPACITY: usize = 256;
const DECIDED_BY: &str = "cli";

pub struct RunOptions {
    pub file: PathBuf,
    pub vars: Vec<String>,
    pub parallelism: Option<usize>,
    pub auto_approve: bool,
    pub reject: Vec<String>,
    pub memory: bool,
    pub json: bool,
    pub quiet: bool,
}

pub async fn run(state: &AppState, options: RunOptions) -> Result<()> {
    if options.memory {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        run_with(state, options, repo).await
    } else {
        let repo = Arc::new(state.open_repository().await?);
        run_with(state, options, repo).await
    }
}

async fn run_with<R: WorkflowRepository + 'static>(
    state: &AppState,
    options: RunOptions,
    repo: Arc<R>,
) -> Result<()> {
    let mut plan = load_plan(state, &options.file)?;
    if let Some(degree) = options.parallelism {
        if degree == 0 {
            bail!("--parallelism must be at least 1");
        }
        plan = plan.with_degree_of_parallelism(degree);
    }

    let variables = parse_vars(&options.vars)?;
    for name in &options.reject {
        let gated = plan.task(name).is_some_and(|t| t.approval.is_some());
        if !gated {
            bail!("--reject {name}: no task with a manual approval gate has that name");
        }
    }

    let task_count = plan.len();
    let bus = EventBus::new(EVENT_CAPACITY);
    let events = bus.subscribe();
    let executor = DagExecutor::new(repo, bus);

    let handle = executor
        .start(Arc::new(plan), variables)
        .await
        .context("Failed to start workflow run")?;
    let execution_id = handle.execution_id();

    let progress = if options.json || options.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(task_count as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    };

    let policy = ApprovalPolicy {
        auto_approve: options.auto_approve,
        reject: options.reject.iter().cloned().collect(),
        interactive: console::user_attended_stderr() && !options.json,
    };
    let watcher = tokio::spawn(watch_events(
        RunEvents::new(events, execution_id),
        handle.approvals(),
        policy,
        progress.clone(),
    ));

    let cancel = handle.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(execution_id = %execution_id, "interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = handle.wait().await;
    ctrl_c.abort();
    // The watcher ends on RunFinished; a lagged receiver may miss it.
    watcher.abort();
    progress.finish_and_clear();

    let result = result.context("Workflow run did not finish")?;
    print_result(&result, options.json)?;

    match result.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "Workflow '{}' {}: {}",
            result.workflow_name,
            status.to_string().to_lowercase(),
            result.error.as_deref().unwrap_or("see task results")
        ),
    }
}

/// Parse `Name=<json>` overrides. Values that are not valid JSON are strings.
pub fn parse_vars(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut vars = BTreeMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid --var '{entry}': expected Name=value"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid --var '{entry}': empty variable name");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        if vars.insert(name.to_string(), value).is_some() {
            bail!("Variable '{name}' given more than once");
        }
    }
    Ok(vars)
}

// ---------------------------------------------------------------------------
// Event watching and approvals
// ---------------------------------------------------------------------------

struct ApprovalPolicy {
    auto_approve: bool,
    reject: HashSet<String>,
    interactive: bool,
}

/// What the CLI does with a gate that just opened.
#[derive(Debug, PartialEq, Eq)]
enum GateAction {
    Approve,
    Reject(String),
    Prompt,
}

impl ApprovalPolicy {
    fn action_for(&self, task_name: &str) -> GateAction {
        if self.reject.contains(task_name) {
            GateAction::Reject("rejected via --reject".to_string())
        } else if self.auto_approve {
            GateAction::Approve
        } else if self.interactive {
            GateAction::Prompt
        } else {
            GateAction::Reject("no interactive terminal to approve".to_string())
        }
    }
}

async fn watch_events(
    mut events: RunEvents,
    approvals: ApprovalHandle,
    policy: ApprovalPolicy,
    progress: ProgressBar,
) {
    // A task can report more than one terminal event (Failed then Skipped under a Skip policy).
    let mut finished: HashSet<String> = HashSet::new();
    let mut finish = |task_name: &str| {
        if finished.insert(task_name.to_string()) {
            progress.inc(1);
        }
    };
    while let Some(event) = events.next().await {
        match event {
            WorkflowEvent::TaskStarted {
                task_name, attempt, ..
            } => {
                if attempt > 1 {
                    progress.set_message(format!("{task_name} (attempt {attempt})"));
                } else {
                    progress.set_message(task_name);
                }
            }
            WorkflowEvent::TaskCompleted { task_name, .. }
            | WorkflowEvent::TaskSkipped { task_name, .. } => finish(&task_name),
            WorkflowEvent::TaskFailed {
                task_name,
                error,
                will_retry,
                ..
            } => {
                if will_retry {
                    progress.println(format!(
                        "  {} {task_name} failed, retrying: {error}",
                        style("!").yellow()
                    ));
                } else {
                    finish(&task_name);
                    progress.println(format!("  {} {task_name} failed: {error}", style("x").red()));
                }
            }
            WorkflowEvent::TaskApprovalDecided {
                task_name,
                decision: ApprovalDecision::Rejected,
                ..
            } => finish(&task_name),
            WorkflowEvent::TaskAwaitingApproval {
                task_name, message, ..
            } => {
                let decided = match policy.action_for(&task_name) {
                    GateAction::Approve => approvals.approve(&task_name, Some(DECIDED_BY.to_string())),
                    GateAction::Reject(comment) => approvals.reject(
                        &task_name,
                        Some(DECIDED_BY.to_string()),
                        Some(comment),
                    ),
                    GateAction::Prompt => {
                        prompt_decision(&approvals, task_name.clone(), message, progress.clone())
                            .await
                    }
                };
                if let Err(e) = decided {
                    tracing::warn!(task = %task_name, error = %e, "approval decision not delivered");
                }
            }
            WorkflowEvent::TriggerDispatched {
                source_task,
                trigger_task,
                ..
            } => {
                progress.println(format!(
                    "  {} {source_task} -> {trigger_task}",
                    style("~").magenta()
                ));
            }
            WorkflowEvent::RunStarted { .. }
            | WorkflowEvent::TaskApprovalDecided { .. }
            | WorkflowEvent::RunFinished { .. } => {}
        }
    }
}

/// Ask on the terminal. Runs the blocking prompt off the async workers.
async fn prompt_decision(
    approvals: &ApprovalHandle,
    task_name: String,
    message: Option<String>,
    progress: ProgressBar,
) -> Result<(), weaver_core::workflow::approval::ApprovalError> {
    let prompt_task = task_name.clone();
    let answer = tokio::task::spawn_blocking(move || {
        progress.suspend(|| -> std::io::Result<(bool, Option<String>)> {
            let prompt = match &message {
                Some(m) => format!("{prompt_task}: {m}"),
                None => format!("Approve task '{prompt_task}'?"),
            };
            let choice = Select::new()
                .with_prompt(prompt)
                .items(&["Approve", "Reject"])
                .default(0)
                .interact()
                .map_err(std::io::Error::other)?;
            if choice == 0 {
                return Ok((true, None));
            }
            let comment: String = Input::new()
                .with_prompt("Reason (optional)")
                .allow_empty(true)
                .interact_text()
                .map_err(std::io::Error::other)?;
            Ok((false, (!comment.trim().is_empty()).then_some(comment)))
        })
    })
    .await;

    match answer {
        Ok(Ok((true, _))) => approvals.approve(&task_name, Some(DECIDED_BY.to_string())),
        Ok(Ok((false, comment))) => {
            approvals.reject(&task_name, Some(DECIDED_BY.to_string()), comment)
        }
        Ok(Err(e)) => {
            tracing::warn!(task = %task_name, error = %e, "approval prompt failed, rejecting");
            approvals.reject(
                &task_name,
                Some(DECIDED_BY.to_string()),
                Some(format!("prompt failed: {e}")),
            )
        }
        Err(e) => {
            tracing::warn!(task = %task_name, error = %e, "approval prompt aborted, rejecting");
            approvals.reject(&task_name, Some(DECIDED_BY.to_string()), None)
        }
    }
}

// ---------------------------------------------------------------------------
// Result rendering
// ---------------------------------------------------------------------------

fn print_result(result: &WorkflowExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    for task in &result.tasks {
        table.add_row(vec![
            Cell::new(&task.task_name),
            format_task_status(task.status),
            Cell::new(task.attempts),
            Cell::new(elapsed(task.started_at, task.completed_at)),
            Cell::new(task_detail(task)),
        ]);
    }

    println!();
    println!(
        "  Workflow '{}' ({})",
        style(&result.workflow_name).cyan(),
        style(result.id).dim()
    );
    println!("{table}");

    let status = match result.status {
        ExecutionStatus::Completed => style(result.status.to_string()).green(),
        ExecutionStatus::Cancelled => style(result.status.to_string()).yellow(),
        _ => style(result.status.to_string()).red(),
    };
    println!(
        "  {status}: {} completed, {} failed, {} skipped in {}",
        result.count(TaskStatus::Completed),
        result.count(TaskStatus::Failed) + result.count(TaskStatus::Rejected),
        result.count(TaskStatus::Skipped),
        elapsed(Some(result.started_at), result.completed_at)
    );
    if let Some(error) = &result.error {
        println!("  {}", style(error).dim());
    }
    println!();

    Ok(())
}

fn task_detail(task: &weaver_types::execution::TaskExecutionResult) -> String {
    match (task.status, &task.skip_reason, &task.error, &task.output) {
        (TaskStatus::Skipped, Some(reason), Some(err), _) => {
            truncate(&format!("{reason}: {err}"), 60)
        }
        (TaskStatus::Skipped, Some(reason), None, _) => reason.to_string(),
        (_, _, Some(err), _) => truncate(err, 60),
        (_, _, None, Some(output)) => truncate(&output.to_string(), 60),
        _ => String::new(),
    }
}
