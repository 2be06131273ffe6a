//! Workflow domain types for Tradeflow.
//!
//! Defines the workflow template (`Workflow` + ordered `WorkflowStep`s), the
//! run records the engine writes while executing (`WorkflowExecution`,
//! `WorkflowStepExecution`), and recurring trigger definitions
//! (`WorkflowSchedule`). Behaviour that only touches a single record (status
//! transitions, timing, statistics) lives here; orchestration lives in
//! `tradeflow-core`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Deprecated,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Inactive => "inactive",
            WorkflowStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, versioned workflow template.
///
/// Steps are stored separately and fetched ordered by `order` through the
/// repository. Statistics are only ever advanced after an execution finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 primary key.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Unique short code (e.g. "supplier_sync"). Used in execution IDs.
    pub code: String,
    /// Free-form type tag (e.g. "supplier_sync", "listing_sync").
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    pub status: WorkflowStatus,
    /// Upper bound on manual re-runs of a failed execution.
    pub max_retries: u32,
    /// Fixed delay between step retry attempts.
    pub retry_delay_seconds: u64,
    /// Whole-run timeout. Zero disables the limit.
    pub timeout_minutes: u32,
    #[serde(default)]
    pub total_executions: u64,
    #[serde(default)]
    pub successful_executions: u64,
    #[serde(default)]
    pub failed_executions: u64,
    #[serde(default)]
    pub average_duration_seconds: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a draft workflow with default retry/timeout policy.
    pub fn new(name: impl Into<String>, code: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            code: code.into(),
            workflow_type: workflow_type.into(),
            description: None,
            version: "1.0".to_string(),
            status: WorkflowStatus::Draft,
            max_retries: 3,
            retry_delay_seconds: 60,
            timeout_minutes: 60,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            average_duration_seconds: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A workflow can run only when it is active and has at least one step.
    pub fn can_execute(&self, step_count: usize) -> bool {
        self.status == WorkflowStatus::Active && step_count > 0
    }

    /// Percentage of executions that succeeded (0 when nothing has run).
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / self.total_executions as f64 * 100.0
    }

    /// Fold one finished execution into the running statistics.
    ///
    /// The average only tracks successful runs, using the incremental mean
    /// `new = (old * (n - 1) + d) / n`.
    pub fn record_outcome(&mut self, success: bool, duration_seconds: Option<f64>) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
            if let Some(d) = duration_seconds {
                let n = self.successful_executions as f64;
                self.average_duration_seconds = (self.average_duration_seconds * (n - 1.0) + d) / n;
            }
        } else {
            self.failed_executions += 1;
        }
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The capability a step invokes.
///
/// Built-in kinds are closed; anything else is carried as `Custom(name)` and
/// must be registered with the executor registry at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    DataFetch,
    DataTransform,
    DataValidate,
    ApiCall,
    DatabaseQuery,
    AiProcess,
    Notification,
    Custom(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::DataFetch => "data_fetch",
            StepKind::DataTransform => "data_transform",
            StepKind::DataValidate => "data_validate",
            StepKind::ApiCall => "api_call",
            StepKind::DatabaseQuery => "database_query",
            StepKind::AiProcess => "ai_process",
            StepKind::Notification => "notification",
            StepKind::Custom(name) => name.as_str(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, StepKind::Custom(_))
    }
}

impl From<String> for StepKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "data_fetch" => StepKind::DataFetch,
            "data_transform" => StepKind::DataTransform,
            "data_validate" => StepKind::DataValidate,
            "api_call" => StepKind::ApiCall,
            "database_query" => StepKind::DatabaseQuery,
            "ai_process" => StepKind::AiProcess,
            "notification" => StepKind::Notification,
            _ => StepKind::Custom(value),
        }
    }
}

impl From<&str> for StepKind {
    fn from(value: &str) -> Self {
        StepKind::from(value.to_string())
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        match kind {
            StepKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step configuration.
///
/// `input_mapping` maps an input key to a dot-path into the execution
/// context; `default_inputs` seed the input before mapping. Every other key
/// is an executor-specific parameter kept in `params`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_inputs: Map<String, Value>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl StepConfig {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// Comparison used by a `value_check` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
}

/// Precondition deciding whether a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    /// Sandboxed boolean expression over the execution context.
    Expression { expression: String },
    /// Compare the value at a context dot-path against a literal.
    ValueCheck {
        path: String,
        operator: CompareOperator,
        value: Value,
    },
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Unique within the workflow.
    pub name: String,
    pub step_type: StepKind,
    /// Execution order, unique within the workflow.
    pub order: i32,
    #[serde(default)]
    pub config: StepConfig,
    /// Failure of an optional step does not abort the workflow.
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default = "default_true")]
    pub can_retry: bool,
    #[serde(default)]
    pub max_retries: u32,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(default)]
    pub can_run_parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Step IDs that must have completed before this step starts.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    /// Create a sequential, non-optional step with no retries.
    pub fn new(workflow_id: Uuid, name: impl Into<String>, step_type: StepKind, order: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.into(),
            step_type,
            order,
            config: StepConfig::default(),
            is_optional: false,
            can_retry: true,
            max_retries: 0,
            timeout_seconds: 300,
            condition: None,
            can_run_parallel: false,
            parallel_group: None,
            depends_on: Vec::new(),
        }
    }

    /// Retries granted after the first attempt.
    pub fn effective_max_retries(&self) -> u32 {
        if self.can_retry { self.max_retries } else { 0 }
    }

    /// The parallel group key, if this step may share a batch.
    pub fn parallel_key(&self) -> Option<&str> {
        if !self.can_run_parallel {
            return None;
        }
        self.parallel_group.as_deref().filter(|g| !g.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Api,
    Event,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Api => "api",
            TriggerType::Event => "event",
            TriggerType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    /// Human-facing unique key: `<workflow code>_<timestamp>_<random>`.
    pub execution_id: String,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    pub input_data: Value,
    pub output_data: Value,
    /// Full shared state at the last persisted point.
    pub context_data: Value,
    pub total_steps: u32,
    pub completed_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<Uuid>,
    pub retry_count: u32,
    /// The failed execution this one re-runs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Create a pending execution for `workflow`.
    pub fn new(
        workflow: &Workflow,
        total_steps: u32,
        input_data: Value,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let suffix = id.simple().to_string();
        Self {
            id,
            execution_id: format!(
                "{}_{}_{}",
                workflow.code,
                now.format("%Y%m%d_%H%M%S"),
                &suffix[suffix.len() - 8..]
            ),
            workflow_id: workflow.id,
            status: ExecutionStatus::Pending,
            trigger_type,
            triggered_by,
            input_data,
            output_data: Value::Object(Map::new()),
            context_data: Value::Object(Map::new()),
            total_steps,
            completed_steps: 0,
            current_step: None,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            error_step: None,
            retry_count: 0,
            retried_from: None,
            created_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// pending -> running.
    pub fn start(&mut self) {
        self.start_at(Utc::now());
    }

    pub fn start_at(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now);
    }

    /// running -> completed | failed, stamping completion timing.
    pub fn complete(&mut self, success: bool, error_message: Option<String>) {
        self.complete_at(Utc::now(), success, error_message);
    }

    pub fn complete_at(&mut self, now: DateTime<Utc>, success: bool, error_message: Option<String>) {
        self.status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.error_message = error_message;
        self.finish_timing(now);
    }

    /// Cancel a pending or running execution. Returns `false` when the
    /// execution is already in another state.
    pub fn cancel(&mut self) -> bool {
        self.cancel_at(Utc::now())
    }

    pub fn cancel_at(&mut self, now: DateTime<Utc>) -> bool {
        if !matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::Running) {
            return false;
        }
        self.status = ExecutionStatus::Cancelled;
        self.finish_timing(now);
        true
    }

    /// Record `n` processed steps, never exceeding `total_steps`.
    pub fn set_completed_steps(&mut self, n: u32) {
        self.completed_steps = n.min(self.total_steps).max(self.completed_steps);
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.completed_steps as f64 / self.total_steps as f64 * 100.0
    }

    fn finish_timing(&mut self, now: DateTime<Utc>) {
        let started = *self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
        self.duration_seconds = Some(seconds_between(started, now));
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
    Cancelled,
}

impl StepExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepExecutionStatus::Pending => "pending",
            StepExecutionStatus::Running => "running",
            StepExecutionStatus::Completed => "completed",
            StepExecutionStatus::Failed => "failed",
            StepExecutionStatus::Skipped => "skipped",
            StepExecutionStatus::Retrying => "retrying",
            StepExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepExecutionStatus::Completed
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Skipped
                | StepExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record for one step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    /// Parent `WorkflowExecution::id`.
    pub execution_id: Uuid,
    pub step_id: Uuid,
    /// Denormalized for display.
    pub step_name: String,
    pub status: StepExecutionStatus,
    pub execution_order: u32,
    pub input_data: Value,
    pub output_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    pub retry_count: u32,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl WorkflowStepExecution {
    /// Create a pending record for `step`.
    pub fn new(execution_id: Uuid, step: &WorkflowStep, execution_order: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step.id,
            step_name: step.name.clone(),
            status: StepExecutionStatus::Pending,
            execution_order,
            input_data: Value::Object(Map::new()),
            output_data: Value::Object(Map::new()),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            metrics: HashMap::new(),
        }
    }

    /// Enter (or re-enter after a retry) the running state. The first
    /// attempt's start time is kept so the duration spans every attempt.
    pub fn start(&mut self, input: Value) {
        self.status = StepExecutionStatus::Running;
        self.input_data = input;
        self.started_at.get_or_insert_with(Utc::now);
        self.completed_at = None;
        self.duration_seconds = None;
    }

    pub fn complete(&mut self, output: Value, metrics: HashMap<String, f64>) {
        self.status = StepExecutionStatus::Completed;
        self.output_data = output;
        self.metrics = metrics;
        self.error_message = None;
        self.finish_timing();
    }

    pub fn fail(&mut self, error: impl Into<String>, details: Option<Value>) {
        self.status = StepExecutionStatus::Failed;
        self.error_message = Some(error.into());
        self.error_details = details;
        self.finish_timing();
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepExecutionStatus::Skipped;
        self.error_message = Some(reason.into());
        self.finish_timing();
    }

    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        self.status = StepExecutionStatus::Retrying;
        self.error_message = Some(error.into());
        self.retry_count += 1;
    }

    pub fn cancel(&mut self) {
        self.status = StepExecutionStatus::Cancelled;
        self.finish_timing();
    }

    fn finish_timing(&mut self) {
        let now = Utc::now();
        let started = *self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
        self.duration_seconds = Some(seconds_between(started, now));
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// When a schedule fires. Times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Standard 5-field cron expression.
    Cron { expression: String },
    /// Fixed interval in seconds.
    Interval { seconds: u64 },
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Day of month (1-31); short months fire on their last day.
    Monthly { day: u32, at: NaiveTime },
}

impl ScheduleSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleSpec::Cron { .. } => "cron",
            ScheduleSpec::Interval { .. } => "interval",
            ScheduleSpec::Daily { .. } => "daily",
            ScheduleSpec::Weekly { .. } => "weekly",
            ScheduleSpec::Monthly { .. } => "monthly",
        }
    }
}

/// Recurring trigger bound to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub input_data: Value,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_runs: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowSchedule {
    pub fn new(workflow_id: Uuid, name: impl Into<String>, spec: ScheduleSpec) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.into(),
            spec,
            input_data: Value::Object(Map::new()),
            is_active: true,
            next_run_at: None,
            last_run_at: None,
            total_runs: 0,
            created_at: Utc::now(),
        }
    }

    /// Active and `next_run_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.is_some_and(|next| next <= now)
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
