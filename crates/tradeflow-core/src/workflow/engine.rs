//! Workflow engine: runs a workflow's batches and owns execution state.
//!
//! `WorkflowEngine` creates the execution record, walks the batches produced
//! by [`resolve_batches`], hands steps to the [`StepRunner`] (inline for
//! single steps, on a `JoinSet` bounded by the shared worker semaphore for
//! parallel batches), persists progress after each batch, and finalises the
//! record and workflow statistics.
//!
//! Background runs are tracked by a `TaskTracker` so `shutdown` can drain
//! them. Each live run has a `CancellationToken` registered under its
//! execution ID.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tradeflow_types::config::EngineConfig;
use tradeflow_types::error::RepositoryError;
use tradeflow_types::event::WorkflowEvent;
use tradeflow_types::workflow::{
    ExecutionStatus, StepExecutionStatus, TriggerType, Workflow, WorkflowExecution, WorkflowStep,
};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::dag::{Batch, resolve_batches};
use super::executor::ExecutorRegistry;
use super::step_runner::{RunScope, StepRunOutcome, StepRunner};
use crate::event::EventBus;
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors from workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow '{code}' cannot be executed (status {status}, {step_count} steps)")]
    NotExecutable {
        code: String,
        status: String,
        step_count: usize,
    },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("dependencies not met for step '{step_name}'")]
    DependenciesNotMet {
        step_id: Uuid,
        step_name: String,
        missing: Vec<Uuid>,
    },

    #[error("step '{step_name}' failed: {error}")]
    StepFailed {
        step_id: Uuid,
        step_name: String,
        error: String,
    },

    #[error("workflow timed out after {0} minutes")]
    WorkflowTimeout(u32),

    #[error("execution cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("retry limit reached ({retry_count}/{max_retries})")]
    RetryLimitReached { retry_count: u32, max_retries: u32 },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// The step that caused the failure, if any.
    pub fn step_id(&self) -> Option<Uuid> {
        match self {
            EngineError::DependenciesNotMet { step_id, .. } | EngineError::StepFailed { step_id, .. } => {
                Some(*step_id)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates workflow executions.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: Arc<R>,
    runner: Arc<StepRunner<R>>,
    workers: Arc<Semaphore>,
    event_bus: EventBus,
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    tracker: TaskTracker,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, registry: Arc<ExecutorRegistry>, config: &EngineConfig, event_bus: EventBus) -> Self {
        let runner = StepRunner::new(
            Arc::clone(&repo),
            registry,
            event_bus.clone(),
            config.optional_steps_skip_unmet_dependencies,
        );
        Self {
            repo,
            runner: Arc::new(runner),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            event_bus,
            cancellation_tokens: DashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run `workflow` to completion.
    ///
    /// Returns the finished execution. A run cancelled from outside returns
    /// the persisted cancelled record; any other failure is recorded on the
    /// execution and returned as an error.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: Value,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
    ) -> Result<WorkflowExecution, EngineError> {
        let steps = self.repo.list_steps(&workflow.id).await?;
        ensure_executable(workflow, &steps)?;
        let execution = WorkflowExecution::new(workflow, steps.len() as u32, input, triggered_by, trigger_type);
        self.run_execution(workflow, &steps, execution).await
    }

    /// Run `workflow` on a tracked background task.
    pub fn execute_async(
        self: &Arc<Self>,
        workflow: Workflow,
        input: Value,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
    ) -> Result<JoinHandle<Result<WorkflowExecution, EngineError>>, EngineError> {
        if self.tracker.is_closed() {
            return Err(EngineError::ShuttingDown);
        }
        let engine = Arc::clone(self);
        Ok(self.tracker.spawn(async move {
            engine
                .execute(&workflow, input, triggered_by, trigger_type)
                .await
        }))
    }

    /// Stop accepting background runs and wait for the running ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        tracing::info!(pending = self.tracker.len(), "waiting for background executions");
        self.tracker.wait().await;
    }

    /// Cancel a pending or running execution.
    pub async fn cancel(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut execution = self
            .repo
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        if !execution.cancel() || !self.repo.update_execution(&execution).await? {
            return Err(EngineError::InvalidState(format!(
                "execution {} is {} and cannot be cancelled",
                execution.execution_id, execution.status
            )));
        }

        self.cancel_open_steps(execution_id).await?;

        if let Some(token) = self.cancellation_tokens.get(execution_id) {
            token.cancel();
        }

        tracing::info!(execution_id = %execution.execution_id, "execution cancelled");
        self.event_bus.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: execution.id,
        });
        Ok(execution)
    }

    /// Re-run a failed execution as a new execution with the same input.
    pub async fn retry(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let failed = self
            .repo
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        if failed.status != ExecutionStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "only failed executions can be retried, {} is {}",
                failed.execution_id, failed.status
            )));
        }

        let workflow = self
            .repo
            .get_workflow(&failed.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(failed.workflow_id.to_string()))?;

        if failed.retry_count >= workflow.max_retries {
            return Err(EngineError::RetryLimitReached {
                retry_count: failed.retry_count,
                max_retries: workflow.max_retries,
            });
        }

        let steps = self.repo.list_steps(&workflow.id).await?;
        ensure_executable(&workflow, &steps)?;

        let mut execution = WorkflowExecution::new(
            &workflow,
            steps.len() as u32,
            failed.input_data.clone(),
            failed.triggered_by.clone(),
            failed.trigger_type,
        );
        execution.retry_count = failed.retry_count + 1;
        execution.retried_from = Some(failed.id);

        tracing::info!(
            execution_id = %execution.execution_id,
            retried_from = %failed.execution_id,
            retry_count = execution.retry_count,
            "retrying execution"
        );
        self.run_execution(&workflow, &steps, execution).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Persist the pending record and run it. The cancellation token is
    /// registered before the record exists, so a cancel can always reach it.
    async fn run_execution(
        &self,
        workflow: &Workflow,
        steps: &[WorkflowStep],
        mut execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, EngineError> {
        let token = CancellationToken::new();
        self.cancellation_tokens.insert(execution.id, token.clone());

        let context = ExecutionContext::new(workflow.id, execution.id, execution.input_data.clone());
        execution.context_data = context.to_value();
        let id = execution.id;
        let result = match self.repo.create_execution(&execution).await {
            Ok(()) => self.start_and_run(workflow, steps, execution, context, token).await,
            Err(e) => Err(e.into()),
        };

        self.cancellation_tokens.remove(&id);
        result
    }

    /// Move a persisted pending execution to running and walk its batches.
    ///
    /// An execution cancelled while still pending is returned as persisted
    /// without running any step.
    async fn start_and_run(
        &self,
        workflow: &Workflow,
        steps: &[WorkflowStep],
        mut execution: WorkflowExecution,
        mut context: ExecutionContext,
        token: CancellationToken,
    ) -> Result<WorkflowExecution, EngineError> {
        execution.start();
        if !self.repo.update_execution(&execution).await? {
            tracing::info!(execution_id = %execution.execution_id, "execution cancelled before start");
            return self.persisted(&execution.id).await;
        }

        tracing::info!(
            execution_id = %execution.execution_id,
            workflow = %workflow.code,
            trigger = %execution.trigger_type,
            total_steps = execution.total_steps,
            "execution started"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution.id,
            execution_key: execution.execution_id.clone(),
            workflow_code: workflow.code.clone(),
            trigger_type: execution.trigger_type,
            total_steps: execution.total_steps,
        });

        let scope = RunScope {
            workflow: Arc::new(workflow.clone()),
            execution_id: execution.id,
            cancel: token.clone(),
        };

        let run = self.run_batches(&scope, steps, &mut execution, &mut context);
        let result = if workflow.timeout_minutes > 0 {
            let limit = Duration::from_secs(u64::from(workflow.timeout_minutes) * 60);
            let timed = tokio::time::timeout(limit, run).await;
            match timed {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    if let Err(e) = self.cancel_open_steps(&execution.id).await {
                        tracing::error!(
                            execution_id = %execution.execution_id,
                            error = %e,
                            "failed to cancel open steps after timeout"
                        );
                    }
                    Err(EngineError::WorkflowTimeout(workflow.timeout_minutes))
                }
            }
        } else {
            run.await
        };

        execution.context_data = context.to_value();

        match result {
            Ok(()) => {
                execution.output_data = context.output_data();
                execution.complete(true, None);
                if !self.repo.update_execution(&execution).await? {
                    return self.persisted(&execution.id).await;
                }
                self.repo
                    .record_execution_outcome(&workflow.id, true, execution.duration_seconds)
                    .await?;
                tracing::info!(
                    execution_id = %execution.execution_id,
                    duration_seconds = execution.duration_seconds.unwrap_or_default(),
                    "execution completed"
                );
                self.event_bus.publish(WorkflowEvent::ExecutionCompleted {
                    execution_id: execution.id,
                    duration_ms: duration_ms(execution.duration_seconds),
                });
                Ok(execution)
            }
            Err(EngineError::Cancelled) => self.persisted(&execution.id).await,
            Err(e) => {
                execution.error_step = e.step_id();
                execution.complete(false, Some(e.to_string()));
                if !self.repo.update_execution(&execution).await? {
                    return self.persisted(&execution.id).await;
                }
                self.repo
                    .record_execution_outcome(&workflow.id, false, execution.duration_seconds)
                    .await?;
                tracing::error!(
                    execution_id = %execution.execution_id,
                    error = %e,
                    "execution failed"
                );
                self.event_bus.publish(WorkflowEvent::ExecutionFailed {
                    execution_id: execution.id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_batches(
        &self,
        scope: &RunScope,
        steps: &[WorkflowStep],
        execution: &mut WorkflowExecution,
        context: &mut ExecutionContext,
    ) -> Result<(), EngineError> {
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut finished_steps = 0u32;
        let mut next_order = 0u32;

        for batch in resolve_batches(steps) {
            if scope.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match batch {
                Batch::Single(step) => {
                    next_order += 1;
                    let outcome = self
                        .runner
                        .run(scope, step, next_order, context, &completed)
                        .await?;
                    absorb(step, outcome, context, &mut completed);
                    finished_steps += 1;
                    execution.current_step = Some(step.id);
                }
                Batch::Parallel { group, steps: members } => {
                    tracing::debug!(
                        execution_id = %scope.execution_id,
                        group = %group,
                        size = members.len(),
                        "running parallel batch"
                    );
                    let outcomes = self
                        .run_parallel(scope, &members, next_order, context, &completed)
                        .await?;
                    next_order += members.len() as u32;
                    for (step, outcome) in members.iter().zip(outcomes) {
                        absorb(step, outcome, context, &mut completed);
                        finished_steps += 1;
                    }
                    execution.current_step = members.last().map(|s| s.id);
                }
            }

            execution.set_completed_steps(finished_steps);
            execution.context_data = context.to_value();
            if !self.repo.update_execution(execution).await? {
                return Err(EngineError::Cancelled);
            }
            self.event_bus.publish(WorkflowEvent::ExecutionProgress {
                execution_id: execution.id,
                completed_steps: execution.completed_steps,
                total_steps: execution.total_steps,
            });
        }

        Ok(())
    }

    /// Run a parallel batch against a snapshot of the context.
    ///
    /// Outcomes are returned in declared order. The first non-optional
    /// failure cancels the remaining siblings and is returned once every
    /// task has finished.
    async fn run_parallel(
        &self,
        scope: &RunScope,
        members: &[&WorkflowStep],
        base_order: u32,
        context: &ExecutionContext,
        completed: &HashSet<Uuid>,
    ) -> Result<Vec<StepRunOutcome>, EngineError> {
        let batch_token = scope.cancel.child_token();
        let batch_scope = RunScope {
            cancel: batch_token.clone(),
            ..scope.clone()
        };
        let snapshot = Arc::new(context.clone());
        let completed = Arc::new(completed.clone());

        let mut set = JoinSet::new();
        for (index, step) in members.iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let workers = Arc::clone(&self.workers);
            let scope = batch_scope.clone();
            let snapshot = Arc::clone(&snapshot);
            let completed = Arc::clone(&completed);
            let step = (*step).clone();
            let order = base_order + index as u32 + 1;

            set.spawn(async move {
                let permit = tokio::select! {
                    permit = workers.acquire_owned() => permit,
                    _ = scope.cancel.cancelled() => return (index, Err(EngineError::Cancelled)),
                };
                let Ok(_permit) = permit else {
                    return (index, Err(EngineError::InvalidState("worker pool closed".to_string())));
                };
                let outcome = runner.run(&scope, &step, order, &snapshot, &completed).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<StepRunOutcome>> = vec![None; members.len()];
        let mut first_error: Option<EngineError> = None;

        while let Some(joined) = set.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    batch_token.cancel();
                    first_error.get_or_insert(EngineError::InvalidState(format!("step task failed: {e}")));
                    continue;
                }
            };
            match outcome {
                Ok(outcome) => outcomes[index] = Some(outcome),
                Err(EngineError::Cancelled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        tracing::warn!(
                            execution_id = %scope.execution_id,
                            step = %members[index].name,
                            "parallel step failed, cancelling siblings"
                        );
                        batch_token.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if scope.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        outcomes
            .into_iter()
            .map(|o| o.ok_or(EngineError::Cancelled))
            .collect()
    }

    /// Move every non-terminal step record of an execution to cancelled.
    async fn cancel_open_steps(&self, execution_id: &Uuid) -> Result<(), EngineError> {
        for mut record in self.repo.list_step_executions(execution_id).await? {
            if matches!(
                record.status,
                StepExecutionStatus::Pending | StepExecutionStatus::Running | StepExecutionStatus::Retrying
            ) {
                record.cancel();
                self.repo.update_step_execution(&record).await?;
            }
        }
        Ok(())
    }

    async fn persisted(&self, id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        self.repo
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }
}

fn ensure_executable(workflow: &Workflow, steps: &[WorkflowStep]) -> Result<(), EngineError> {
    if workflow.can_execute(steps.len()) {
        return Ok(());
    }
    Err(EngineError::NotExecutable {
        code: workflow.code.clone(),
        status: workflow.status.to_string(),
        step_count: steps.len(),
    })
}

fn absorb(
    step: &WorkflowStep,
    outcome: StepRunOutcome,
    context: &mut ExecutionContext,
    completed: &mut HashSet<Uuid>,
) {
    if let StepRunOutcome::Completed { output, context_updates } = outcome {
        context.apply_outcome(step, output, context_updates);
        completed.insert(step.id);
    }
}

fn duration_ms(seconds: Option<f64>) -> u64 {
    (seconds.unwrap_or_default() * 1000.0).max(0.0) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
