//! CLI execution subcommands: list, show, cancel, retry.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;

use tradeflow_core::service::workflow::{ExecutionReport, WorkflowRef};
use tradeflow_types::workflow::ExecutionStatus;

use super::{
    execution_status_cell, format_duration, format_time, new_table, print_json, short_id,
    step_status_cell,
};
use crate::state::AppState;

/// Execution subcommands.
#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// List recent executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Only executions of this workflow (code or ID).
        #[arg(long, short)]
        workflow: Option<String>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show an execution and its step records.
    Show {
        /// Execution ID or execution key.
        execution: String,
    },

    /// Cancel a pending or running execution.
    Cancel {
        /// Execution ID or execution key.
        execution: String,
    },

    /// Re-run a failed execution with the same input.
    Retry {
        /// Execution ID or execution key.
        execution: String,
    },
}

/// Handle an execution subcommand.
pub async fn handle_execution_command(cmd: ExecutionCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ExecutionCommand::List { workflow, limit } => handle_list(workflow.as_deref(), limit, state, json).await,
        ExecutionCommand::Show { execution } => {
            let execution = state.workflow_service.find_execution(&execution).await?;
            let report = state.workflow_service.execution_report(&execution.id).await?;
            print_report(&report, json)
        }
        ExecutionCommand::Cancel { execution } => handle_cancel(&execution, state, json).await,
        ExecutionCommand::Retry { execution } => handle_retry(&execution, state, json).await,
    }
}

async fn handle_list(workflow: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let reference = workflow.map(str::parse::<WorkflowRef>).transpose()?;
    let executions = state
        .workflow_service
        .list_executions(reference.as_ref(), limit)
        .await?;

    if json {
        return print_json(&executions);
    }

    if executions.is_empty() {
        println!();
        println!("  No executions yet.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Execution").fg(Color::Cyan),
        Cell::new("Status"),
        Cell::new("Trigger"),
        Cell::new("Steps"),
        Cell::new("Started"),
        Cell::new("Duration"),
    ]);
    for e in &executions {
        table.add_row(vec![
            Cell::new(&e.execution_id),
            execution_status_cell(e.status),
            Cell::new(e.trigger_type.as_str()),
            Cell::new(format!("{}/{}", e.completed_steps, e.total_steps)),
            Cell::new(format_time(e.started_at)),
            Cell::new(format_duration(e.duration_seconds)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_cancel(key: &str, state: &AppState, json: bool) -> Result<()> {
    let execution = state.workflow_service.find_execution(key).await?;
    let cancelled = state.workflow_service.cancel(&execution.id).await?;

    if json {
        return print_json(&cancelled);
    }
    println!();
    println!(
        "  {} Cancelled execution {}",
        style("*").yellow().bold(),
        style(&cancelled.execution_id).cyan()
    );
    println!();
    Ok(())
}

async fn handle_retry(key: &str, state: &AppState, json: bool) -> Result<()> {
    let execution = state.workflow_service.find_execution(key).await?;
    let retried = state.workflow_service.retry(&execution.id).await?;
    let report = state.workflow_service.execution_report(&retried.id).await?;

    if !json {
        println!();
        println!(
            "  {} Retried {} as {}",
            style("*").green().bold(),
            style(&execution.execution_id).dim(),
            style(&retried.execution_id).cyan()
        );
    }
    print_report(&report, json)
}

/// Print an execution with its step table.
pub fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    let e = &report.execution;
    println!();
    println!("  {} {}", style("Execution:").bold(), style(&e.execution_id).cyan());
    println!("  ID: {}", e.id);
    println!("  Status: {}", status_text(e.status));
    println!(
        "  Trigger: {}{}",
        e.trigger_type.as_str(),
        e.triggered_by
            .as_deref()
            .map(|by| format!(" by {by}"))
            .unwrap_or_default()
    );
    println!(
        "  Progress: {}/{} steps ({:.0}%)",
        e.completed_steps,
        e.total_steps,
        e.progress_percentage()
    );
    println!("  Started: {}", format_time(e.started_at));
    println!("  Completed: {}", format_time(e.completed_at));
    println!("  Duration: {}", format_duration(e.duration_seconds));
    if e.retry_count > 0 {
        if let Some(from) = e.retried_from {
            println!("  Retry #{} of {}", e.retry_count, short_id(&from));
        }
    }
    if let Some(err) = &e.error_message {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if report.steps.is_empty() {
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Step"),
        Cell::new("Status"),
        Cell::new("Retries"),
        Cell::new("Duration"),
        Cell::new("Error"),
    ]);
    for s in &report.steps {
        let error = s
            .error_message
            .as_deref()
            .map(|m| m.chars().take(60).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(s.execution_order),
            Cell::new(&s.step_name),
            step_status_cell(s.status),
            Cell::new(s.retry_count),
            Cell::new(format_duration(s.duration_seconds)),
            Cell::new(error),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

fn status_text(status: ExecutionStatus) -> String {
    let text = style(status.as_str());
    match status {
        ExecutionStatus::Completed => text.green().to_string(),
        ExecutionStatus::Failed => text.red().to_string(),
        ExecutionStatus::Cancelled => text.yellow().to_string(),
        _ => text.cyan().to_string(),
    }
}
