//! Plan compilation.
//!
//! `compile` is the whole load phase: structural validation, graph analysis,
//! policy resolution, expression compilation with reference checks and
//! executor resolution. A `WorkflowPlan` only exists for a definition that
//! passed every check, and it is immutable for the lifetime of its runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use weaver_types::config::EngineConfig;
use weaver_types::workflow::WorkflowDefinition;

use super::branch::CompiledBranch;
use super::dag::DependencyGraph;
use super::definition::{WorkflowError, validate_graph_rules, validate_structure};
use super::expression::template::value_contains_template;
use super::expression::{Expr, References, ValueTemplate, parse_condition};
use super::policy::{ResolvedPolicy, check_handling, resolve_task_policy};
use super::task_executor::{ExecutorRegistry, TaskExecutor};

// ---------------------------------------------------------------------------
// Compiled types
// ---------------------------------------------------------------------------

/// Manual approval settings of a gated task.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalConfig {
    pub message: Option<String>,
    pub approvers: Vec<String>,
    /// An undecided gate is rejected once this elapses.
    pub timeout: Option<Duration>,
}

/// A task ready for scheduling. Indices refer to `WorkflowPlan::tasks`.
pub struct CompiledTask {
    pub name: String,
    pub task_type: String,
    pub operation: Option<String>,
    pub agent: Option<String>,
    pub specification: Value,
    pub parameters: ValueTemplate,
    pub condition: Option<Expr>,
    pub branches: Vec<CompiledBranch>,
    pub approval: Option<ApprovalConfig>,
    pub policy: ResolvedPolicy,
    /// Declared timeout, or the engine default.
    pub timeout: Duration,
    /// Dependencies plus branch owners.
    pub upstream: Vec<usize>,
    pub downstream: Vec<usize>,
    /// Upstream tasks whose terminal failure still lets this task run.
    pub tolerated_failures: BTreeSet<usize>,
    /// Upstream tasks that route to this task through a branch.
    pub branch_owners: Vec<usize>,
    /// Tasks whose TriggerTask policy names this task.
    pub trigger_sources: Vec<usize>,
    pub executor: Arc<dyn TaskExecutor>,
}

impl CompiledTask {
    /// Held back until a trigger releases it.
    pub fn is_compensation(&self) -> bool {
        !self.trigger_sources.is_empty()
    }
}

impl std::fmt::Debug for CompiledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTask")
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .field("upstream", &self.upstream)
            .field("approval", &self.approval)
            .field("trigger_sources", &self.trigger_sources)
            .finish_non_exhaustive()
    }
}

/// A validated, executable workflow.
#[derive(Debug)]
pub struct WorkflowPlan {
    pub name: String,
    pub variables: BTreeMap<String, Value>,
    pub degree_of_parallelism: usize,
    pub workflow_timeout: Duration,
    pub max_output_bytes: usize,
    pub tasks: Vec<CompiledTask>,
    /// Task indices, definition order breaking ties.
    pub topological_order: Vec<usize>,
    index: HashMap<String, usize>,
}

impl WorkflowPlan {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn task(&self, name: &str) -> Option<&CompiledTask> {
        self.index_of(name).map(|i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks with no upstream, in definition order.
    pub fn roots(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.upstream.is_empty())
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn compensation_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.is_compensation())
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn topological_names(&self) -> Vec<&str> {
        self.topological_order
            .iter()
            .map(|&i| self.tasks[i].name.as_str())
            .collect()
    }

    /// Override the concurrency bound (minimum 1).
    pub fn with_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.degree_of_parallelism = degree.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Validate `def` and compile it into an executable plan.
pub fn compile(
    def: &WorkflowDefinition,
    registry: &ExecutorRegistry,
    config: &EngineConfig,
) -> Result<WorkflowPlan, WorkflowError> {
    validate_structure(def, config)?;

    let graph = DependencyGraph::build(&def.tasks);
    let report = graph.analyze().ensure_valid()?;
    validate_graph_rules(def, &graph)?;

    let default_handling = def.configuration.error_handling.as_ref();
    check_handling(default_handling, config, "workflow default errorHandling")?;

    let mut policies = Vec::with_capacity(def.tasks.len());
    for (idx, task) in def.tasks.iter().enumerate() {
        policies.push(resolve_task_policy(task, idx, default_handling, &graph, config)?);
    }

    let mut trigger_sources: Vec<Vec<usize>> = vec![Vec::new(); def.tasks.len()];
    for (idx, policy) in policies.iter().enumerate() {
        if let Some(target) = policy.trigger_target().and_then(|t| graph.index_of(t)) {
            trigger_sources[target].push(idx);
        }
    }

    let mut tasks = Vec::with_capacity(def.tasks.len());
    for (idx, (task, policy)) in def.tasks.iter().zip(policies).enumerate() {
        let location = format!("task '{}'", task.name);

        if value_contains_template(&task.execution.specification) {
            return Err(WorkflowError::ValidationError(format!(
                "{location}: specification is static and must not contain '$[' templates"
            )));
        }

        let parameters = ValueTemplate::compile(&task.execution.parameters)
            .map_err(|e| WorkflowError::expression(format!("{location} parameters"), e))?;

        let condition = task
            .execution_condition
            .as_deref()
            .map(parse_condition)
            .transpose()
            .map_err(|e| WorkflowError::expression(format!("{location} executionCondition"), e))?;

        let branches = task
            .conditional_branches
            .iter()
            .map(CompiledBranch::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| WorkflowError::expression(format!("{location} conditionalBranches"), e))?;

        let ancestors = graph.ancestors(idx);
        let mut refs = parameters.references();
        if let Some(cond) = &condition {
            refs.extend(cond.references());
        }
        check_references(def, &graph, &ancestors, None, &refs, &location)?;
        for branch in &branches {
            check_references(
                def,
                &graph,
                &ancestors,
                Some(idx),
                &branch.expression.references(),
                &format!("{location} branch to '{}'", branch.target),
            )?;
        }

        let executor = registry
            .get(&task.task_type)
            .ok_or_else(|| WorkflowError::UnknownTaskType {
                task: task.name.clone(),
                task_type: task.task_type.clone(),
            })?;

        let approval = task
            .manual_approval
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| ApprovalConfig {
                message: a.message.clone(),
                approvers: a.approvers.clone(),
                timeout: a.timeout_milliseconds.map(Duration::from_millis),
            });

        let tolerated_failures = task
            .run_on_failure_of
            .iter()
            .filter_map(|n| graph.index_of(n))
            .collect();

        let branch_owners = graph
            .upstream(idx)
            .iter()
            .copied()
            .filter(|&owner| {
                def.tasks[owner]
                    .conditional_branches
                    .iter()
                    .any(|b| b.task_name == task.name)
            })
            .collect();

        tasks.push(CompiledTask {
            name: task.name.clone(),
            task_type: task.task_type.clone(),
            operation: task.execution.operation.clone(),
            agent: task.execution.agent.clone(),
            specification: task.execution.specification.clone(),
            parameters,
            condition,
            branches,
            approval,
            policy,
            timeout: Duration::from_millis(
                task.execution
                    .timeout_milliseconds
                    .unwrap_or(config.default_task_timeout_ms),
            ),
            upstream: graph.upstream(idx).to_vec(),
            downstream: graph.downstream(idx).to_vec(),
            tolerated_failures,
            branch_owners,
            trigger_sources: std::mem::take(&mut trigger_sources[idx]),
            executor,
        });
    }

    let topological_order = report
        .topological_order
        .iter()
        .filter_map(|n| graph.index_of(n))
        .collect();

    let degree = def
        .configuration
        .degree_of_parallelism
        .unwrap_or(config.default_degree_of_parallelism)
        .max(1);

    let plan = WorkflowPlan {
        name: def.name.clone(),
        variables: def.variables.clone(),
        degree_of_parallelism: degree as usize,
        workflow_timeout: Duration::from_millis(
            def.configuration
                .timeout_milliseconds
                .unwrap_or(config.default_workflow_timeout_ms),
        ),
        max_output_bytes: config.max_output_bytes,
        index: tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect(),
        tasks,
        topological_order,
    };

    tracing::debug!(
        workflow = %plan.name,
        tasks = plan.len(),
        parallelism = plan.degree_of_parallelism,
        "compiled workflow plan"
    );
    Ok(plan)
}

/// Variables must be declared; results must come from upstream tasks.
///
/// `own` additionally allows the task itself (branch expressions read the
/// owner's output).
fn check_references(
    def: &WorkflowDefinition,
    graph: &DependencyGraph,
    ancestors: &BTreeSet<usize>,
    own: Option<usize>,
    refs: &References,
    location: &str,
) -> Result<(), WorkflowError> {
    for name in &refs.variables {
        if !def.variables.contains_key(name) {
            return Err(WorkflowError::ExpressionError(format!(
                "{location}: variable '{name}' is not declared"
            )));
        }
    }
    for name in &refs.results {
        let Some(idx) = graph.index_of(name) else {
            return Err(WorkflowError::ExpressionError(format!(
                "{location}: Results('{name}') references an unknown task"
            )));
        };
        if !(ancestors.contains(&idx) || own == Some(idx)) {
            return Err(WorkflowError::ExpressionError(format!(
                "{location}: Results('{name}') is not an upstream task"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
