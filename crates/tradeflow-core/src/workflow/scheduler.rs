//! Polling scheduler for recurring workflow triggers.
//!
//! Provides:
//! - Next-occurrence computation for every [`ScheduleSpec`] kind
//! - Human-readable schedule parsing ("every 5 minutes", "daily at 09:30")
//! - A single cooperative loop that fires due schedules through the engine

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tradeflow_types::error::RepositoryError;
use tradeflow_types::workflow::{ScheduleSpec, TriggerType, WorkflowExecution, WorkflowSchedule};
use uuid::Uuid;

use super::engine::{EngineError, WorkflowEngine};
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or schedule string.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The schedule points at a workflow that no longer exists.
    #[error("workflow {0} not found for schedule")]
    WorkflowNotFound(Uuid),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Occurrence computation
// ---------------------------------------------------------------------------

/// Normalize a 5-field cron expression to croner's 6-field form.
///
/// 6-field expressions (with seconds) pass through unchanged.
pub fn normalize_cron(expression: &str) -> Result<String, SchedulerError> {
    let trimmed = expression.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        n => Err(SchedulerError::InvalidSchedule(format!(
            "cron expression '{trimmed}' has {n} fields, expected 5"
        ))),
    }
}

/// First occurrence of `spec` strictly after `after`. All times are UTC.
pub fn next_run_after(
    spec: &ScheduleSpec,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    match spec {
        ScheduleSpec::Cron { expression } => {
            let normalized = normalize_cron(expression)?;
            let cron = normalized
                .parse::<croner::Cron>()
                .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))?;
            cron.iter_after(after).next().ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("{expression}: no future occurrence"))
            })
        }
        ScheduleSpec::Interval { seconds } => {
            if *seconds == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be at least one second".to_string(),
                ));
            }
            i64::try_from(*seconds)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|delta| after.checked_add_signed(delta))
                .ok_or_else(|| out_of_range(spec))
        }
        ScheduleSpec::Daily { at } => {
            let today = at_time(after.date_naive(), *at);
            if today > after {
                return Ok(today);
            }
            after
                .date_naive()
                .checked_add_days(Days::new(1))
                .map(|d| at_time(d, *at))
                .ok_or_else(|| out_of_range(spec))
        }
        ScheduleSpec::Weekly { weekday, at } => (0..=7)
            .filter_map(|offset| after.date_naive().checked_add_days(Days::new(offset)))
            .filter(|d| d.weekday() == *weekday)
            .map(|d| at_time(d, *at))
            .find(|candidate| *candidate > after)
            .ok_or_else(|| out_of_range(spec)),
        ScheduleSpec::Monthly { day, at } => {
            if !(1..=31).contains(day) {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "day of month must be 1-31, got {day}"
                )));
            }
            let (mut year, mut month) = (after.year(), after.month());
            for _ in 0..13 {
                let candidate = last_day_of_month(year, month)
                    .and_then(|last| NaiveDate::from_ymd_opt(year, month, (*day).min(last)))
                    .map(|d| at_time(d, *at));
                if let Some(candidate) = candidate.filter(|c| *c > after) {
                    return Ok(candidate);
                }
                (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            }
            Err(out_of_range(spec))
        }
    }
}

fn at_time(date: NaiveDate, at: NaiveTime) -> DateTime<Utc> {
    date.and_time(at).and_utc()
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
}

fn out_of_range(spec: &ScheduleSpec) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("{} schedule has no representable next run", spec.kind()))
}

// ---------------------------------------------------------------------------
// Human-readable schedule parsing
// ---------------------------------------------------------------------------

/// Parse a schedule string into a [`ScheduleSpec`].
///
/// Supported patterns (case-insensitive):
/// - 5- or 6-field cron                  -> `Cron`
/// - "every N seconds|minutes|hours|days" -> `Interval`
/// - "hourly"                             -> `Interval { 3600 }`
/// - "daily" / "daily at HH:MM"           -> `Daily`
/// - "weekly on <day> at HH:MM"           -> `Weekly`
/// - "monthly on <day> at HH:MM"          -> `Monthly`
///
/// The result is validated by computing one occurrence.
pub fn parse_schedule(input: &str) -> Result<ScheduleSpec, SchedulerError> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    let spec = match words.as_slice() {
        ["hourly"] => ScheduleSpec::Interval { seconds: 3600 },
        ["every", n, unit] => ScheduleSpec::Interval {
            seconds: parse_count(n)? * unit_seconds(unit)?,
        },
        ["every", unit] => ScheduleSpec::Interval { seconds: unit_seconds(unit)? },
        ["daily"] => ScheduleSpec::Daily { at: NaiveTime::MIN },
        ["daily", "at", time] => ScheduleSpec::Daily { at: parse_time(time)? },
        ["weekly", "on", day, "at", time] => ScheduleSpec::Weekly {
            weekday: parse_weekday(day)?,
            at: parse_time(time)?,
        },
        ["monthly", "on", day, "at", time] => ScheduleSpec::Monthly {
            day: day
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .map_err(|_| SchedulerError::InvalidSchedule(format!("invalid day of month '{day}'")))?,
            at: parse_time(time)?,
        },
        fields if fields.len() == 5 || fields.len() == 6 => ScheduleSpec::Cron {
            expression: trimmed.to_string(),
        },
        _ => {
            return Err(SchedulerError::InvalidSchedule(format!(
                "unrecognized schedule format: '{trimmed}'"
            )));
        }
    };

    next_run_after(&spec, Utc::now())?;
    Ok(spec)
}

fn parse_count(n: &str) -> Result<u64, SchedulerError> {
    match n.parse::<u64>() {
        Ok(0) => Err(SchedulerError::InvalidSchedule("interval must be > 0".to_string())),
        Ok(v) => Ok(v),
        Err(_) => Err(SchedulerError::InvalidSchedule(format!("invalid number '{n}'"))),
    }
}

fn unit_seconds(unit: &str) -> Result<u64, SchedulerError> {
    match unit.trim_end_matches('s') {
        "second" | "sec" => Ok(1),
        "minute" | "min" => Ok(60),
        "hour" => Ok(3600),
        "day" => Ok(86_400),
        _ => Err(SchedulerError::InvalidSchedule(format!("unknown time unit '{unit}'"))),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, SchedulerError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| SchedulerError::InvalidSchedule(format!("invalid time '{s}', expected HH:MM")))
}

fn parse_weekday(s: &str) -> Result<Weekday, SchedulerError> {
    s.parse::<Weekday>()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("invalid weekday '{s}'")))
}

// ---------------------------------------------------------------------------
// ScheduleRunner
// ---------------------------------------------------------------------------

/// Join handle of a triggered background run.
pub type ExecutionHandle = JoinHandle<Result<WorkflowExecution, EngineError>>;

/// Fires due schedules through the engine.
///
/// One cooperative loop: poll, trigger, sleep. Triggered runs execute on
/// the engine's tracked background tasks, so `WorkflowEngine::shutdown`
/// drains them.
pub struct ScheduleRunner<R: WorkflowRepository> {
    engine: Arc<WorkflowEngine<R>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl<R: WorkflowRepository + 'static> ScheduleRunner<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ask the loop to exit. Interrupts the poll sleep.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Poll until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        tracing::info!(poll_interval_secs = self.poll_interval.as_secs(), "scheduler started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once(Utc::now()).await {
                Ok(handles) if !handles.is_empty() => {
                    tracing::info!(triggered = handles.len(), "scheduled workflows triggered");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "schedule poll failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Run one poll at `now`: initialise new schedules, then trigger every
    /// due one. Returns the handles of the runs that were started.
    ///
    /// A due schedule is always advanced, even when its trigger fails.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionHandle>, SchedulerError> {
        let repo = self.engine.repository();
        self.initialise_new(now).await?;

        let mut handles = Vec::new();
        for schedule in repo.list_due_schedules(now).await? {
            match self.trigger(&schedule).await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::warn!(
                    schedule_id = %schedule.id,
                    schedule = %schedule.name,
                    error = %e,
                    "scheduled trigger failed"
                ),
            }

            let next = match next_run_after(&schedule.spec, now) {
                Ok(next) => Some(next),
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "schedule has no next run");
                    None
                }
            };
            if let Err(e) = repo.mark_schedule_run(&schedule.id, now, next).await {
                tracing::error!(schedule_id = %schedule.id, error = %e, "failed to record schedule run");
            }
        }
        Ok(handles)
    }

    async fn trigger(&self, schedule: &WorkflowSchedule) -> Result<ExecutionHandle, SchedulerError> {
        let workflow = self
            .engine
            .repository()
            .get_workflow(&schedule.workflow_id)
            .await?
            .ok_or(SchedulerError::WorkflowNotFound(schedule.workflow_id))?;

        tracing::debug!(
            schedule_id = %schedule.id,
            workflow = %workflow.code,
            "triggering scheduled workflow"
        );
        let handle = self.engine.execute_async(
            workflow,
            schedule.input_data.clone(),
            Some(format!("schedule:{}", schedule.name)),
            TriggerType::Scheduled,
        )?;
        Ok(handle)
    }

    /// Give active schedules that never ran a first `next_run_at`. Schedules
    /// whose spec cannot produce one are deactivated.
    async fn initialise_new(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let repo = self.engine.repository();
        for mut schedule in repo.list_schedules(None).await? {
            if !schedule.is_active || schedule.next_run_at.is_some() || schedule.last_run_at.is_some() {
                continue;
            }
            match next_run_after(&schedule.spec, now) {
                Ok(next) => schedule.next_run_at = Some(next),
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "deactivating invalid schedule");
                    schedule.is_active = false;
                }
            }
            repo.save_schedule(&schedule).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
