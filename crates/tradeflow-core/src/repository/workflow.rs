//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow templates and their steps,
//! execution records, step execution records, and schedules. The
//! infrastructure layer (tradeflow-infra) implements this trait with SQLite
//! persistence.

use chrono::{DateTime, Utc};
use tradeflow_types::error::RepositoryError;
use tradeflow_types::workflow::{
    Workflow, WorkflowExecution, WorkflowSchedule, WorkflowStep, WorkflowStepExecution,
};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Workflows:** templates, their ordered steps, and running statistics.
/// - **Executions:** one record per run, finalised at most once.
/// - **Step executions:** one record per (execution, step) pair.
/// - **Schedules:** recurring triggers and their bookkeeping.
///
/// Counter updates are atomic at the storage level. Execution writes are
/// guarded so a terminal record is never overwritten.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow (insert or replace by ID).
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    fn get_workflow_by_code(
        &self,
        code: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List all workflows ordered by code.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Delete a workflow and its steps and schedules. Returns `true` if it
    /// existed, `Conflict` if any execution references it.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Atomically fold one finished execution into the workflow statistics.
    ///
    /// The running average only moves on successful runs with a duration.
    fn record_execution_outcome(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_seconds: Option<f64>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Upsert a single step.
    fn save_step(
        &self,
        step: &WorkflowStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace all steps of a workflow in one transaction.
    fn replace_steps(
        &self,
        workflow_id: &Uuid,
        steps: &[WorkflowStep],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List a workflow's steps ordered by `order` ascending.
    fn list_steps(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStep>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Look up an execution by its human-facing `execution_id` key.
    fn get_execution_by_key(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Write every mutable field of an execution, but only while the stored
    /// record is still `pending` or `running`. Returns `false` when the
    /// stored record is already terminal (or missing) and nothing changed.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Point `current_step` at `step_id` (guarded like `update_execution`).
    fn set_current_step(
        &self,
        execution_id: &Uuid,
        step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List executions newest first, optionally for one workflow.
    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Insert a step execution. `Conflict` if the (execution, step) pair
    /// already has one.
    fn create_step_execution(
        &self,
        record: &WorkflowStepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_step_execution(
        &self,
        record: &WorkflowStepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List an execution's step records ordered by `execution_order`.
    fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Upsert a schedule.
    fn save_schedule(
        &self,
        schedule: &WorkflowSchedule,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_schedule(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowSchedule>, RepositoryError>> + Send;

    /// List schedules, optionally for one workflow.
    fn list_schedules(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowSchedule>, RepositoryError>> + Send;

    /// Active schedules whose `next_run_at` is at or before `now`.
    fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowSchedule>, RepositoryError>> + Send;

    /// Atomically record a run: `last_run_at = ran_at`, `total_runs += 1`,
    /// `next_run_at = next`.
    fn mark_schedule_run(
        &self,
        id: &Uuid,
        ran_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn delete_schedule(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
