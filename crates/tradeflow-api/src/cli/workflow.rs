//! CLI workflow definition subcommands: import, list, show.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use serde_json::json;

use tradeflow_core::service::workflow::WorkflowRef;
use tradeflow_core::workflow::definition::{discover_workflows, load_workflow_file};
use tradeflow_infra::filesystem::workflows_dir;
use tradeflow_types::workflow::{Workflow, WorkflowStatus, WorkflowStep};

use super::{new_table, print_json};
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Import a YAML definition file, or every file in a directory.
    ///
    /// Without a path, imports everything in `{data_dir}/workflows/`.
    Import {
        /// YAML file or directory.
        path: Option<PathBuf>,
    },

    /// List imported workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow and its steps.
    Show {
        /// Workflow code or ID.
        workflow: String,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { path } => handle_import(path, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { workflow } => handle_show(&workflow, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(path: Option<PathBuf>, state: &AppState, json: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| workflows_dir(&state.data_dir));

    let files = if path.is_dir() {
        discover_workflows(&path)?
    } else {
        let file = load_workflow_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", path.display()))?;
        vec![(path.clone(), file)]
    };

    if files.is_empty() {
        bail!("No workflow definitions found in {}", path.display());
    }

    let mut imported = Vec::new();
    for (file_path, file) in files {
        let (workflow, steps) = state
            .workflow_service
            .import_definition(file)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to import {}: {e}", file_path.display()))?;
        imported.push((file_path, workflow, steps.len()));
    }

    if json {
        let out: Vec<_> = imported
            .iter()
            .map(|(file_path, wf, steps)| {
                json!({
                    "file": file_path.display().to_string(),
                    "id": wf.id,
                    "code": wf.code,
                    "version": wf.version,
                    "steps": steps,
                })
            })
            .collect();
        return print_json(&out);
    }

    println!();
    for (file_path, wf, steps) in &imported {
        println!(
            "  {} Imported '{}' v{} ({} steps) from {}",
            style("*").green().bold(),
            style(&wf.code).cyan(),
            wf.version,
            steps,
            style(file_path.display()).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.workflow_service.list_workflows().await?;

    if json {
        return print_json(&workflows);
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows imported.");
        println!(
            "  Import one with: {}",
            style("tflow workflow import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Code").fg(Color::Cyan),
        Cell::new("Name"),
        Cell::new("Version"),
        Cell::new("Status"),
        Cell::new("Runs"),
        Cell::new("Success"),
        Cell::new("Avg"),
    ]);

    for wf in &workflows {
        table.add_row(vec![
            Cell::new(&wf.code),
            Cell::new(&wf.name),
            Cell::new(&wf.version),
            workflow_status_cell(wf.status),
            Cell::new(wf.total_executions),
            Cell::new(format!("{:.0}%", wf.success_rate())),
            Cell::new(super::format_duration(
                (wf.successful_executions > 0).then_some(wf.average_duration_seconds),
            )),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn workflow_status_cell(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Active => Color::Green,
        WorkflowStatus::Draft => Color::Grey,
        WorkflowStatus::Inactive | WorkflowStatus::Deprecated => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(workflow: &str, state: &AppState, json: bool) -> Result<()> {
    let reference: WorkflowRef = workflow.parse()?;
    let (wf, steps) = state.workflow_service.workflow_detail(&reference).await?;

    if json {
        return print_json(&json!({ "workflow": wf, "steps": steps }));
    }

    print_workflow_header(&wf);
    if steps.is_empty() {
        println!("  No steps defined.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Step"),
        Cell::new("Type"),
        Cell::new("Depends on"),
        Cell::new("Group"),
        Cell::new("Retries"),
        Cell::new("Timeout"),
        Cell::new("Flags"),
    ]);
    for step in &steps {
        table.add_row(vec![
            Cell::new(step.order),
            Cell::new(&step.name),
            Cell::new(step.step_type.as_str()),
            Cell::new(dependency_names(step, &steps)),
            Cell::new(step.parallel_group.as_deref().unwrap_or("-")),
            Cell::new(if step.can_retry {
                step.effective_max_retries().to_string()
            } else {
                "off".to_string()
            }),
            Cell::new(format!("{}s", step.timeout_seconds)),
            Cell::new(step_flags(step)),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn print_workflow_header(wf: &Workflow) {
    println!();
    println!(
        "  {} {} ({}) v{}",
        style("Workflow:").bold(),
        style(&wf.name).cyan(),
        wf.code,
        wf.version
    );
    if let Some(description) = &wf.description {
        println!("  {}", style(description).dim());
    }
    println!("  ID: {}", wf.id);
    println!("  Status: {}", wf.status.as_str());
    println!(
        "  Retries: {} every {}s, timeout {}m",
        wf.max_retries, wf.retry_delay_seconds, wf.timeout_minutes
    );
    println!(
        "  Runs: {} ({} ok, {} failed)",
        wf.total_executions, wf.successful_executions, wf.failed_executions
    );
    println!();
}

fn dependency_names(step: &WorkflowStep, steps: &[WorkflowStep]) -> String {
    if step.depends_on.is_empty() {
        return "-".to_string();
    }
    step.depends_on
        .iter()
        .map(|id| {
            steps
                .iter()
                .find(|s| &s.id == id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| super::short_id(id))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn step_flags(step: &WorkflowStep) -> String {
    let mut flags = Vec::new();
    if step.is_optional {
        flags.push("optional");
    }
    if step.condition.is_some() {
        flags.push("conditional");
    }
    if step.can_run_parallel {
        flags.push("parallel");
    }
    if flags.is_empty() { "-".to_string() } else { flags.join(", ") }
}
