//! CLI command definitions and dispatch for the `tflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`tflow workflow import`, `tflow execution show`), with `run` and
//! `scheduler` as top-level verbs.

pub mod execution;
pub mod run;
pub mod schedule;
pub mod workflow;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use serde_json::Value;
use tradeflow_types::workflow::{ExecutionStatus, StepExecutionStatus};

use execution::ExecutionCommand;
use schedule::ScheduleCommand;
use workflow::WorkflowCommand;

/// Run and schedule e-commerce workflows.
#[derive(Parser)]
#[command(name = "tflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "TRADEFLOW_LOG_JSON")]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "TRADEFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },

    /// Run a workflow and follow its progress.
    Run {
        /// Workflow code or ID.
        workflow: String,

        /// JSON input, or `@path` to read it from a file.
        #[arg(long, short)]
        input: Option<String>,

        /// Recorded as `triggered_by` on the execution.
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Inspect, cancel and retry executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        command: ExecutionCommand,
    },

    /// Manage recurring triggers.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Run the scheduler loop until interrupted.
    Scheduler {
        /// Seconds between polls (defaults to `poll_interval_secs` from config.toml).
        #[arg(long)]
        poll_secs: Option<u64>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a JSON argument. `@path` reads the JSON from a file; no argument
/// means an empty object.
pub fn parse_json_arg(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read input file '{path}'"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Invalid JSON input")
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Running => Color::Cyan,
        ExecutionStatus::Cancelled | ExecutionStatus::Paused => Color::Yellow,
        ExecutionStatus::Pending => Color::Grey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn step_status_cell(status: StepExecutionStatus) -> Cell {
    let color = match status {
        StepExecutionStatus::Completed => Color::Green,
        StepExecutionStatus::Failed => Color::Red,
        StepExecutionStatus::Running | StepExecutionStatus::Retrying => Color::Cyan,
        StepExecutionStatus::Skipped | StepExecutionStatus::Cancelled => Color::Yellow,
        StepExecutionStatus::Pending => Color::Grey,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_duration(seconds: Option<f64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 1.0 => format!("{:.0}ms", s * 1000.0),
        Some(s) if s < 60.0 => format!("{s:.1}s"),
        Some(s) => format!("{}m{:02}s", (s / 60.0) as u64, (s % 60.0) as u64),
    }
}

/// First 8 characters of an ID, for tables.
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
