//! Sagaflow CLI entry point.
//!
//! Binary name: `sagaflow`
//!
//! Parses CLI arguments, initializes tracing and the engine, then dispatches
//! to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use sagaflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_options = TracingOptions::for_verbosity(cli.quiet, cli.verbose)
        .json(cli.log_json)
        .otel(cli.otel);
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "sagaflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Start {
            workflow_type,
            input,
            org_id,
            user_id,
            run,
        } => {
            cli::workflow::start(
                &state,
                &workflow_type,
                input.as_deref(),
                org_id.as_deref(),
                user_id.as_deref(),
                run,
                json,
            )
            .await?;
        }

        Commands::Status { workflow_id } => {
            cli::workflow::status(&state, &workflow_id, json).await?;
        }

        Commands::Steps { workflow_id } => {
            cli::workflow::steps(&state, &workflow_id, json).await?;
        }

        Commands::Progress { workflow_id } => {
            cli::workflow::progress(&state, &workflow_id, json).await?;
        }

        Commands::List {
            status,
            workflow_type,
            limit,
        } => {
            cli::workflow::list(&state, status, workflow_type, limit, json).await?;
        }

        Commands::Cancel { workflow_id } => {
            cli::workflow::cancel(&state, &workflow_id, json).await?;
        }

        Commands::Restart {
            workflow_id,
            from_step,
        } => {
            cli::workflow::restart(&state, &workflow_id, from_step.as_deref(), json).await?;
        }

        Commands::Compensate { workflow_id } => {
            cli::workflow::compensate(&state, &workflow_id, json).await?;
        }

        Commands::Stuck => {
            cli::housekeeping::stuck(&state, json).await?;
        }

        Commands::Jobs {
            queue,
            state: job_state,
            limit,
        } => {
            cli::jobs::list(&state, queue, job_state, limit, json).await?;
        }

        Commands::Cleanup => {
            cli::housekeeping::cleanup(&state, json).await?;
        }

        Commands::Worker { once } => {
            cli::worker::run(&state, once, json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
