//! `weaver approvals`: gates still waiting for a decision.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use weaver_core::repository::workflow::WorkflowRepository;

use super::short_id;

pub async fn list_pending(
    repo: &impl WorkflowRepository,
    execution: Option<&str>,
    json: bool,
) -> Result<()> {
    let execution_id = execution
        .map(|s| {
            s.parse::<uuid::Uuid>()
                .with_context(|| format!("Invalid execution ID: '{s}'"))
        })
        .transpose()?;

    let pending = repo
        .get_pending_approvals(execution_id.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list pending approvals: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!();
        println!("  No approvals pending.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Task"),
            Cell::new("Message"),
            Cell::new("Approvers"),
            Cell::new("Requested"),
            Cell::new("Expires"),
        ]);

    for gate in &pending {
        table.add_row(vec![
            Cell::new(short_id(&gate.execution_id)),
            Cell::new(&gate.task_name),
            Cell::new(gate.message.as_deref().unwrap_or("")),
            Cell::new(gate.approvers.join(", ")),
            Cell::new(gate.requested_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(
                gate.expires_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string()),
            ),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_core::repository::memory::InMemoryWorkflowRepository;

    #[tokio::test]
    async fn test_list_pending_rejects_bad_id() {
        let repo = InMemoryWorkflowRepository::new();
        let err = list_pending(&repo, Some("abc"), true).await.unwrap_err();
        assert!(err.to_string().contains("Invalid execution ID"));
        list_pending(&repo, None, false).await.unwrap();
    }
}
