//! `weaver executions`: browse recorded runs.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use weaver_core::repository::workflow::WorkflowRepository;

use super::{elapsed, format_execution_status, format_task_status, short_id, truncate};

pub async fn list_executions(
    repo: &impl WorkflowRepository,
    limit: u32,
    json: bool,
) -> Result<()> {
    let executions = repo
        .list_executions(limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list executions: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions recorded.");
        println!("  Start one with: {}", style("weaver run <file.json>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for exec in &executions {
        table.add_row(vec![
            Cell::new(short_id(&exec.id)),
            Cell::new(&exec.workflow_name),
            format_execution_status(exec.status),
            Cell::new(exec.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(elapsed(Some(exec.started_at), exec.completed_at)),
            Cell::new(exec.error.as_deref().map(|e| truncate(e, 50)).unwrap_or_default()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

pub async fn show_execution(repo: &impl WorkflowRepository, id_str: &str, json: bool) -> Result<()> {
    let id: uuid::Uuid = id_str
        .parse()
        .with_context(|| format!("Invalid execution ID: '{id_str}'"))?;

    let execution = repo
        .get_execution(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get execution: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Execution '{id_str}' not found"))?;
    let approvals = repo
        .list_approvals(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list approvals: {e}"))?;

    if json {
        let out = serde_json::json!({
            "execution": execution,
            "approvals": approvals,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Workflow '{}' ({})",
        style(&execution.workflow_name).cyan(),
        style(execution.id).dim()
    );
    println!("  Status: {}", execution.status);
    println!(
        "  Started: {}  Duration: {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S"),
        elapsed(Some(execution.started_at), execution.completed_at)
    );
    if let Some(error) = &execution.error {
        println!("  Error: {}", style(error).red());
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
            Cell::new("Skip reason"),
            Cell::new("Error"),
        ]);
    for task in &execution.tasks {
        table.add_row(vec![
            Cell::new(&task.task_name),
            format_task_status(task.status),
            Cell::new(task.attempts),
            Cell::new(elapsed(task.started_at, task.completed_at)),
            Cell::new(task.skip_reason.map(|r| r.to_string()).unwrap_or_default()),
            Cell::new(task.error.as_deref().map(|e| truncate(e, 50)).unwrap_or_default()),
        ]);
    }
    println!("{table}");

    if !approvals.is_empty() {
        println!();
        println!("  Approvals:");
        for record in &approvals {
            println!(
                "    {} {} by {}{}",
                record.task_name,
                record.decision,
                record.decided_by.as_deref().unwrap_or("unknown"),
                record
                    .comment
                    .as_deref()
                    .map(|c| format!(" ({c})"))
                    .unwrap_or_default()
            );
        }
    }
    println!();

    Ok(())
}
