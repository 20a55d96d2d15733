//! CLI command definitions for the `weaver` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod approvals;
pub mod executions;
pub mod run;
pub mod schema;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use weaver_types::execution::{ExecutionStatus, TaskStatus};

/// Run and inspect DAG workflows.
#[derive(Parser)]
#[command(name = "weaver", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "WEAVER_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate a workflow definition without running it.
    Validate {
        /// Path to a `.json`, `.yaml` or `.yml` definition.
        file: PathBuf,
    },

    /// Run a workflow to completion.
    Run {
        /// Path to a `.json`, `.yaml` or `.yml` definition.
        file: PathBuf,

        /// Override a declared variable: `Name=<json>` (bare text is taken as a string).
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Override the degree of parallelism.
        #[arg(long)]
        parallelism: Option<usize>,

        /// Approve every manual approval gate without prompting.
        #[arg(long)]
        auto_approve: bool,

        /// Reject the named task's approval gate (repeatable).
        #[arg(long = "reject", value_name = "TASK")]
        reject: Vec<String>,

        /// Keep records in memory instead of the SQLite database.
        #[arg(long)]
        memory: bool,
    },

    /// Print the JSON Schema of the definition format.
    Schema,

    /// Inspect recorded executions.
    #[command(alias = "exec")]
    Executions {
        #[command(subcommand)]
        action: ExecutionsCommand,
    },

    /// List manual approvals still waiting for a decision.
    Approvals {
        /// Only show gates of this execution.
        #[arg(long)]
        execution: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ExecutionsCommand {
    /// List recent executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one execution with its task records and approval decisions.
    Show {
        /// Execution UUID.
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Shared rendering helpers
// ---------------------------------------------------------------------------

pub(crate) fn format_execution_status(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        ExecutionStatus::Running => Cell::new("running").fg(Color::Blue),
        ExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
        ExecutionStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}

pub(crate) fn format_task_status(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Pending | TaskStatus::AwaitingApproval => Color::Yellow,
        TaskStatus::Running | TaskStatus::Approved => Color::Blue,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed | TaskStatus::Rejected => Color::Red,
        TaskStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

/// First 8 characters of an id, for table columns.
pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

pub(crate) fn format_duration_ms(ms: i64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

/// Elapsed time between two optional timestamps, or `-`.
pub(crate) fn elapsed(
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> String {
    match (start, end) {
        (Some(s), Some(e)) => format_duration_ms((e - s).num_milliseconds().max(0)),
        _ => "-".to_string(),
    }
}

/// Single-line preview capped at `max` characters.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max && line.len() == text.len() {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
