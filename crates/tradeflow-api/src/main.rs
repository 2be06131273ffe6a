//! Tradeflow CLI entry point.
//!
//! Binary name: `tflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the workflow
//! engine, then dispatches to the matching command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use tradeflow_observe::tracing_setup::{
    TracingOptions, directive_for_verbosity, init_tracing, shutdown_tracing,
};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.quiet && cli.verbose == 0 {
        "error"
    } else {
        directive_for_verbosity(cli.verbose)
    };
    init_tracing(&TracingOptions {
        default_directive: default_directive.to_string(),
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tflow", &mut std::io::stdout());
        return Ok(());
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Workflow { command } => {
            cli::workflow::handle_workflow_command(command, &state, cli.json).await
        }
        Commands::Run { workflow, input, by } => {
            cli::run::handle_run(&workflow, input.as_deref(), by, &state, cli.json, cli.quiet).await
        }
        Commands::Execution { command } => {
            cli::execution::handle_execution_command(command, &state, cli.json).await
        }
        Commands::Schedule { command } => {
            cli::schedule::handle_schedule_command(command, &state, cli.json).await
        }
        Commands::Scheduler { poll_secs } => cli::schedule::run_scheduler(&state, poll_secs).await,
        Commands::Completions { .. } => unreachable!("handled before state init"),
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
///
/// If a handler cannot be installed the corresponding branch never fires.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
