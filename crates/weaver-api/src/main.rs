//! Weaver CLI entry point.
//!
//! Binary name: `weaver`
//!
//! Parses CLI arguments, initializes tracing and application state, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands, ExecutionsCommand};
use state::AppState;
use weaver_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.quiet, cli.verbose), cli.log_json, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Neither completions nor the schema need app state.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "weaver", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Schema => return cli::schema::print_schema(),
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Validate { file } => cli::validate::validate(&state, &file, cli.json),

        Commands::Run {
            file,
            vars,
            parallelism,
            auto_approve,
            reject,
            memory,
        } => {
            let options = cli::run::RunOptions {
                file,
                vars,
                parallelism,
                auto_approve,
                reject,
                memory,
                json: cli.json,
                quiet: cli.quiet,
            };
            cli::run::run(&state, options).await
        }

        Commands::Executions { action } => match action {
            ExecutionsCommand::List { limit } => {
                let repo = state.open_repository().await?;
                cli::executions::list_executions(&repo, limit, cli.json).await
            }
            ExecutionsCommand::Show { id } => {
                let repo = state.open_repository().await?;
                cli::executions::show_execution(&repo, &id, cli.json).await
            }
        },

        Commands::Approvals { execution } => {
            let repo = state.open_repository().await?;
            cli::approvals::list_pending(&repo, execution.as_deref(), cli.json).await
        }

        Commands::Completions { .. } | Commands::Schema => Ok(()),
    }
}
