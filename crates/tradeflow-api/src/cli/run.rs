//! `tflow run`: trigger a workflow and follow it through the event bus.

use anyhow::Result;
use console::style;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use tradeflow_core::service::workflow::WorkflowRef;
use tradeflow_types::event::WorkflowEvent;
use tradeflow_types::workflow::{ExecutionStatus, TriggerType};

use super::execution::print_report;
use super::parse_json_arg;
use crate::state::AppState;

/// Run a workflow to completion, printing step progress as it happens.
///
/// The final report is printed even when the run fails; the command then
/// exits with the engine error.
pub async fn handle_run(
    workflow: &str,
    input: Option<&str>,
    triggered_by: String,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let reference: WorkflowRef = workflow.parse()?;
    let input = parse_json_arg(input)?;
    let service = &state.workflow_service;
    let show_progress = !json && !quiet;

    let mut events = service.engine().event_bus().subscribe();
    let mut handle = service
        .submit_workflow(&reference, input, Some(triggered_by), TriggerType::Manual)
        .await?;

    let mut execution_id: Option<Uuid> = None;
    let mut on_event = |event: WorkflowEvent| {
        if let WorkflowEvent::ExecutionStarted { execution_id: id, .. } = &event {
            execution_id.get_or_insert(*id);
        }
        if show_progress {
            if let Some(line) = describe_event(&event) {
                println!("{line}");
            }
        }
    };

    let result = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            received = events.recv() => match received {
                Ok(event) => on_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress display fell behind");
                }
                Err(RecvError::Closed) => break (&mut handle).await?,
            },
        }
    };
    loop {
        match events.try_recv() {
            Ok(event) => on_event(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    match result {
        Ok(execution) => {
            let report = service.execution_report(&execution.id).await?;
            if !quiet || json {
                print_report(&report, json)?;
            }
            if execution.status == ExecutionStatus::Cancelled {
                anyhow::bail!("execution {} was cancelled", execution.execution_id);
            }
            Ok(())
        }
        Err(err) => {
            if let Some(id) = execution_id {
                let report = service.execution_report(&id).await?;
                if !quiet || json {
                    print_report(&report, json)?;
                }
            }
            Err(err.into())
        }
    }
}

/// One progress line per event; `None` for events not worth a line.
fn describe_event(event: &WorkflowEvent) -> Option<String> {
    let line = match event {
        WorkflowEvent::ExecutionStarted {
            execution_key,
            workflow_code,
            total_steps,
            ..
        } => format!(
            "  {} {} started ({} steps) as {}",
            style("▶").cyan(),
            style(workflow_code).bold(),
            total_steps,
            style(execution_key).dim()
        ),
        WorkflowEvent::StepStarted { step_name, attempt, .. } if *attempt > 1 => format!(
            "    {} {} attempt {}",
            style("↻").yellow(),
            step_name,
            attempt
        ),
        WorkflowEvent::StepStarted { step_name, .. } => {
            format!("    {} {}", style("·").dim(), step_name)
        }
        WorkflowEvent::StepCompleted {
            step_name,
            duration_ms,
            ..
        } => format!(
            "    {} {} {}",
            style("✓").green(),
            step_name,
            style(format!("{duration_ms}ms")).dim()
        ),
        WorkflowEvent::StepRetrying { step_name, error, .. } => format!(
            "    {} {} failed, retrying: {}",
            style("!").yellow(),
            step_name,
            style(error).dim()
        ),
        WorkflowEvent::StepFailed {
            step_name,
            error,
            optional,
            ..
        } => format!(
            "    {} {}{}: {}",
            style("✗").red(),
            step_name,
            if *optional { " (optional)" } else { "" },
            style(error).red()
        ),
        WorkflowEvent::StepSkipped { step_name, reason, .. } => format!(
            "    {} {} skipped: {}",
            style("-").dim(),
            step_name,
            style(reason).dim()
        ),
        WorkflowEvent::ExecutionProgress { .. } => return None,
        WorkflowEvent::ExecutionCompleted { duration_ms, .. } => format!(
            "  {} completed in {}ms",
            style("■").green(),
            duration_ms
        ),
        WorkflowEvent::ExecutionFailed { error, .. } => {
            format!("  {} failed: {}", style("■").red(), style(error).red())
        }
        WorkflowEvent::ExecutionCancelled { .. } => {
            format!("  {} cancelled", style("■").yellow())
        }
    };
    Some(line)
}
