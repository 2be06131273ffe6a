//! Runs one step of one execution.
//!
//! For each step the runner creates its step-execution record, checks
//! dependencies and the step condition, then drives the retry loop: resolve
//! input, invoke the executor under the step timeout, record the outcome.
//! Every path leaves the record in a terminal state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tradeflow_types::event::WorkflowEvent;
use tradeflow_types::workflow::{Workflow, WorkflowStep, WorkflowStepExecution};
use uuid::Uuid;

use super::condition::ConditionEvaluator;
use super::context::ExecutionContext;
use super::engine::EngineError;
use super::executor::{ExecutorRegistry, StepError, StepRequest};
use super::retry::RetryPolicy;
use crate::event::EventBus;
use crate::repository::WorkflowRepository;

/// How a step ended when it did not abort the execution.
#[derive(Debug, Clone)]
pub enum StepRunOutcome {
    Completed {
        output: Value,
        context_updates: Map<String, Value>,
    },
    Skipped {
        reason: String,
    },
    /// An optional step exhausted its attempts.
    FailedOptional {
        error: String,
    },
}

/// Per-execution inputs shared by every step of one run.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub workflow: Arc<Workflow>,
    pub execution_id: Uuid,
    pub cancel: CancellationToken,
}

/// Executes individual steps with retry, timeout and cancellation.
pub struct StepRunner<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<ExecutorRegistry>,
    conditions: ConditionEvaluator,
    event_bus: EventBus,
    skip_optional_unmet_dependencies: bool,
}

impl<R: WorkflowRepository> StepRunner<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<ExecutorRegistry>,
        event_bus: EventBus,
        skip_optional_unmet_dependencies: bool,
    ) -> Self {
        Self {
            repo,
            registry,
            conditions: ConditionEvaluator::new(),
            event_bus,
            skip_optional_unmet_dependencies,
        }
    }

    /// Run `step` against `context`.
    ///
    /// `completed` holds the IDs of steps that completed earlier in this
    /// execution. Returns an error when the execution must abort.
    pub async fn run(
        &self,
        scope: &RunScope,
        step: &WorkflowStep,
        execution_order: u32,
        context: &ExecutionContext,
        completed: &HashSet<Uuid>,
    ) -> Result<StepRunOutcome, EngineError> {
        let mut record = WorkflowStepExecution::new(scope.execution_id, step, execution_order);
        self.repo.create_step_execution(&record).await?;

        let missing: Vec<Uuid> = step
            .depends_on
            .iter()
            .filter(|dep| !completed.contains(dep))
            .copied()
            .collect();
        if !missing.is_empty() {
            if step.is_optional && self.skip_optional_unmet_dependencies {
                return self.skip(scope, step, &mut record, "Dependencies not met").await;
            }
            record.fail(
                "Dependencies not met",
                Some(json!({ "missing": missing.iter().map(Uuid::to_string).collect::<Vec<_>>() })),
            );
            self.repo.update_step_execution(&record).await?;
            self.publish_failed(scope, step, "Dependencies not met");
            return Err(EngineError::DependenciesNotMet {
                step_id: step.id,
                step_name: step.name.clone(),
                missing,
            });
        }

        if !self.conditions.should_run(step.condition.as_ref(), context) {
            return self.skip(scope, step, &mut record, "Condition not met").await;
        }

        self.repo.set_current_step(&scope.execution_id, &step.id).await?;

        let executor = match self.registry.resolve(&step.step_type) {
            Ok(executor) => executor,
            Err(e) => {
                let message = e.to_string();
                record.fail(&message, Some(json!({ "kind": e.kind(), "attempts": 0 })));
                self.repo.update_step_execution(&record).await?;
                self.publish_failed(scope, step, &message);
                return Err(EngineError::StepFailed {
                    step_id: step.id,
                    step_name: step.name.clone(),
                    error: message,
                });
            }
        };

        let policy = RetryPolicy::for_step(&scope.workflow, step);
        let step_timeout = Duration::from_secs(step.timeout_seconds.max(1));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let input = context.resolve_input(&step.config);
            record.start(input.clone());
            self.repo.update_step_execution(&record).await?;
            self.event_bus.publish(WorkflowEvent::StepStarted {
                execution_id: scope.execution_id,
                step_id: step.id,
                step_name: step.name.clone(),
                attempt,
            });
            tracing::debug!(
                execution_id = %scope.execution_id,
                step = %step.name,
                attempt,
                max_attempts = policy.max_attempts(),
                "running step"
            );

            let request = StepRequest {
                execution_id: scope.execution_id,
                step: step.clone(),
                input,
                context: context.clone(),
                attempt,
                cancel: scope.cancel.clone(),
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => Err(StepError::Cancelled),
                result = tokio::time::timeout(step_timeout, executor.execute_boxed(&request)) => {
                    result.unwrap_or_else(|_| Err(StepError::Timeout(step.timeout_seconds)))
                }
            };

            let error = match result {
                Ok(outcome) => {
                    record.complete(outcome.output.clone(), outcome.metrics);
                    self.repo.update_step_execution(&record).await?;
                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        execution_id: scope.execution_id,
                        step_id: step.id,
                        step_name: step.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return Ok(StepRunOutcome::Completed {
                        output: outcome.output,
                        context_updates: outcome.context_updates,
                    });
                }
                Err(StepError::Cancelled) => {
                    return self.cancelled(&mut record).await;
                }
                Err(e) => e,
            };

            let message = error.to_string();
            if policy.should_retry(attempt) {
                tracing::warn!(
                    execution_id = %scope.execution_id,
                    step = %step.name,
                    attempt,
                    error = %message,
                    "step attempt failed, retrying"
                );
                record.mark_retrying(&message);
                self.repo.update_step_execution(&record).await?;
                self.event_bus.publish(WorkflowEvent::StepRetrying {
                    execution_id: scope.execution_id,
                    step_id: step.id,
                    step_name: step.name.clone(),
                    attempt,
                    error: message,
                });

                tokio::select! {
                    _ = scope.cancel.cancelled() => return self.cancelled(&mut record).await,
                    _ = tokio::time::sleep(policy.delay) => {}
                }
                continue;
            }

            record.fail(
                &message,
                Some(json!({
                    "kind": error.kind(),
                    "attempts": attempt,
                    "error": message,
                })),
            );
            self.repo.update_step_execution(&record).await?;
            self.publish_failed(scope, step, &message);

            if step.is_optional {
                tracing::warn!(
                    execution_id = %scope.execution_id,
                    step = %step.name,
                    error = %message,
                    "optional step failed, continuing"
                );
                return Ok(StepRunOutcome::FailedOptional { error: message });
            }
            return Err(EngineError::StepFailed {
                step_id: step.id,
                step_name: step.name.clone(),
                error: message,
            });
        }
    }

    async fn skip(
        &self,
        scope: &RunScope,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        reason: &str,
    ) -> Result<StepRunOutcome, EngineError> {
        tracing::info!(execution_id = %scope.execution_id, step = %step.name, reason, "skipping step");
        record.skip(reason);
        self.repo.update_step_execution(record).await?;
        self.event_bus.publish(WorkflowEvent::StepSkipped {
            execution_id: scope.execution_id,
            step_id: step.id,
            step_name: step.name.clone(),
            reason: reason.to_string(),
        });
        Ok(StepRunOutcome::Skipped {
            reason: reason.to_string(),
        })
    }

    async fn cancelled(&self, record: &mut WorkflowStepExecution) -> Result<StepRunOutcome, EngineError> {
        record.cancel();
        self.repo.update_step_execution(record).await?;
        Err(EngineError::Cancelled)
    }

    fn publish_failed(&self, scope: &RunScope, step: &WorkflowStep, error: &str) {
        self.event_bus.publish(WorkflowEvent::StepFailed {
            execution_id: scope.execution_id,
            step_id: step.id,
            step_name: step.name.clone(),
            error: error.to_string(),
            optional: step.is_optional,
        });
    }
}
