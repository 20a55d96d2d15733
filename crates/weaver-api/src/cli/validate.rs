//! `weaver validate`: load and compile a definition without running it.

use std::path::Path;

use anyhow::Result;
use console::style;
use weaver_core::workflow::definition::{WorkflowError, load_workflow_file};
use weaver_core::workflow::plan::{WorkflowPlan, compile};

use crate::state::AppState;

/// Load `file` and compile it against the registered executors.
pub fn load_plan(state: &AppState, file: &Path) -> Result<WorkflowPlan> {
    let def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow: {msg}"),
        WorkflowError::IoError(err) => {
            anyhow::anyhow!("Failed to read {}: {err}", file.display())
        }
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;

    compile(&def, &state.registry, &state.config)
        .map_err(|e| anyhow::anyhow!("Workflow '{}' is invalid: {e}", def.name))
}

pub fn validate(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let plan = load_plan(state, file)?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": plan.name,
            "tasks": plan.len(),
            "degreeOfParallelism": plan.degree_of_parallelism,
            "timeoutMilliseconds": plan.workflow_timeout.as_millis() as u64,
            "topologicalOrder": plan.topological_names(),
            "roots": plan.roots(),
            "compensationTasks": plan.compensation_tasks(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&plan.name).cyan()
    );
    println!("  Tasks: {}", plan.len());
    println!("  Parallelism: {}", plan.degree_of_parallelism);
    println!("  Order: {}", plan.topological_names().join(" -> "));
    println!("  Roots: {}", plan.roots().join(", "));
    let compensation = plan.compensation_tasks();
    if !compensation.is_empty() {
        println!("  Compensation: {}", compensation.join(", "));
    }
    println!();

    Ok(())
}
