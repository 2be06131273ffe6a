//! CLI schedule subcommands and the `tflow scheduler` daemon.

use std::time::Duration;

use anyhow::Result;
use chrono::Timelike;
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use uuid::Uuid;

use tradeflow_core::service::workflow::WorkflowRef;
use tradeflow_core::workflow::scheduler::{ScheduleRunner, parse_schedule};
use tradeflow_types::workflow::{ScheduleSpec, WorkflowSchedule};

use super::{format_time, new_table, parse_json_arg, print_json};
use crate::state::AppState;

/// Schedule subcommands.
#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Attach a recurring trigger to a workflow.
    ///
    /// WHEN accepts `every 15 minutes`, `hourly`, `daily at 02:00`,
    /// `weekly on mon at 09:30`, `monthly on 1 at 06:00` or a 5-field cron
    /// expression.
    Add {
        /// Workflow code or ID.
        workflow: String,

        /// Schedule name.
        name: String,

        /// When to run.
        when: String,

        /// JSON input for each run, or `@path` to read it from a file.
        #[arg(long, short)]
        input: Option<String>,
    },

    /// List schedules.
    #[command(alias = "ls")]
    List {
        /// Only schedules of this workflow (code or ID).
        #[arg(long, short)]
        workflow: Option<String>,
    },

    /// Stop a schedule from firing.
    Pause {
        /// Schedule ID.
        id: Uuid,
    },

    /// Re-enable a paused schedule; the next run is computed from now.
    Resume {
        /// Schedule ID.
        id: Uuid,
    },

    /// Delete a schedule.
    #[command(alias = "rm")]
    Remove {
        /// Schedule ID.
        id: Uuid,
    },
}

/// Handle a schedule subcommand.
pub async fn handle_schedule_command(cmd: ScheduleCommand, state: &AppState, json: bool) -> Result<()> {
    let service = &state.workflow_service;
    match cmd {
        ScheduleCommand::Add {
            workflow,
            name,
            when,
            input,
        } => {
            let reference: WorkflowRef = workflow.parse()?;
            let spec = parse_schedule(&when)?;
            let input = parse_json_arg(input.as_deref())?;
            let schedule = service.add_schedule(&reference, &name, spec, input).await?;
            if json {
                return print_json(&schedule);
            }
            println!();
            println!(
                "  {} Schedule '{}' added ({}), next run {}",
                style("*").green().bold(),
                style(&schedule.name).cyan(),
                describe_spec(&schedule.spec),
                format_time(schedule.next_run_at)
            );
            println!("  ID: {}", schedule.id);
            println!();
            Ok(())
        }
        ScheduleCommand::List { workflow } => {
            let reference = workflow.as_deref().map(str::parse::<WorkflowRef>).transpose()?;
            let schedules = service.list_schedules(reference.as_ref()).await?;
            if json {
                return print_json(&schedules);
            }
            print_schedules(&schedules);
            Ok(())
        }
        ScheduleCommand::Pause { id } => toggle(state, &id, false, json).await,
        ScheduleCommand::Resume { id } => toggle(state, &id, true, json).await,
        ScheduleCommand::Remove { id } => {
            service.remove_schedule(&id).await?;
            if json {
                return print_json(&serde_json::json!({ "removed": id }));
            }
            println!();
            println!("  {} Schedule {} removed", style("*").yellow().bold(), id);
            println!();
            Ok(())
        }
    }
}

async fn toggle(state: &AppState, id: &Uuid, active: bool, json: bool) -> Result<()> {
    let schedule = state.workflow_service.set_schedule_active(id, active).await?;
    if json {
        return print_json(&schedule);
    }
    println!();
    if active {
        println!(
            "  {} Schedule '{}' resumed, next run {}",
            style("*").green().bold(),
            style(&schedule.name).cyan(),
            format_time(schedule.next_run_at)
        );
    } else {
        println!(
            "  {} Schedule '{}' paused",
            style("*").yellow().bold(),
            style(&schedule.name).cyan()
        );
    }
    println!();
    Ok(())
}

fn print_schedules(schedules: &[WorkflowSchedule]) {
    if schedules.is_empty() {
        println!();
        println!("  No schedules.");
        println!(
            "  Add one with: {}",
            style("tflow schedule add <workflow> <name> \"daily at 02:00\"").dim()
        );
        println!();
        return;
    }

    let mut table = new_table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Name"),
        Cell::new("When"),
        Cell::new("Next run"),
        Cell::new("Last run"),
        Cell::new("Runs"),
        Cell::new("Active"),
    ]);
    for s in schedules {
        table.add_row(vec![
            Cell::new(s.id),
            Cell::new(&s.name),
            Cell::new(describe_spec(&s.spec)),
            Cell::new(format_time(s.next_run_at)),
            Cell::new(format_time(s.last_run_at)),
            Cell::new(s.total_runs),
            if s.is_active {
                Cell::new("yes").fg(Color::Green)
            } else {
                Cell::new("no").fg(Color::Yellow)
            },
        ]);
    }

    println!();
    println!("{table}");
    println!();
}

/// Render a spec back in the form `parse_schedule` accepts.
fn describe_spec(spec: &ScheduleSpec) -> String {
    let hm = |t: &chrono::NaiveTime| format!("{:02}:{:02}", t.hour(), t.minute());
    match spec {
        ScheduleSpec::Cron { expression } => expression.clone(),
        ScheduleSpec::Interval { seconds } => format!("every {seconds} seconds"),
        ScheduleSpec::Daily { at } => format!("daily at {}", hm(at)),
        ScheduleSpec::Weekly { weekday, at } => {
            format!("weekly on {} at {}", weekday.to_string().to_lowercase(), hm(at))
        }
        ScheduleSpec::Monthly { day, at } => format!("monthly on {day} at {}", hm(at)),
    }
}

// ---------------------------------------------------------------------------
// Scheduler daemon
// ---------------------------------------------------------------------------

/// Poll for due schedules until Ctrl+C or SIGTERM, then drain running
/// executions.
pub async fn run_scheduler(state: &AppState, poll_secs: Option<u64>) -> Result<()> {
    let poll_secs = poll_secs.unwrap_or(state.config.poll_interval_secs).max(1);
    let engine = state.workflow_service.engine();
    let runner = ScheduleRunner::new(std::sync::Arc::clone(engine), Duration::from_secs(poll_secs));

    println!();
    println!(
        "  {} Scheduler running (poll every {}s). Press Ctrl+C to stop.",
        style("*").green().bold(),
        poll_secs
    );
    println!();

    tokio::join!(runner.run(), async {
        crate::shutdown_signal().await;
        runner.stop();
    });

    engine.shutdown().await;
    tracing::info!("scheduler drained");
    Ok(())
}
