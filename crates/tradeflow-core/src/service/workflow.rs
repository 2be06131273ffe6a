//! Workflow trigger service.
//!
//! The entry point the CLI (and any embedding host) uses: look up workflows
//! by ID or code, run them synchronously or in the background, cancel and
//! retry executions, import YAML definitions and attach schedules.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tradeflow_types::config::EngineConfig;
use tradeflow_types::error::RepositoryError;
use tradeflow_types::workflow::{
    ScheduleSpec, TriggerType, Workflow, WorkflowExecution, WorkflowSchedule, WorkflowStep,
    WorkflowStepExecution,
};
use uuid::Uuid;

use crate::repository::WorkflowRepository;
use crate::workflow::definition::{DefinitionError, WorkflowFile};
use crate::workflow::engine::{EngineError, WorkflowEngine};
use crate::workflow::scheduler::{ExecutionHandle, SchedulerError, next_run_after};

/// Errors surfaced by [`WorkflowService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowRef),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// How a caller names a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowRef {
    Id(Uuid),
    Code(String),
}

impl FromStr for WorkflowRef {
    type Err = std::convert::Infallible;

    /// UUIDs are taken as IDs, anything else as a code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match Uuid::parse_str(s) {
            Ok(id) => WorkflowRef::Id(id),
            Err(_) => WorkflowRef::Code(s.to_string()),
        })
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowRef::Id(id) => write!(f, "{id}"),
            WorkflowRef::Code(code) => f.write_str(code),
        }
    }
}

/// An execution together with its step records in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStepExecution>,
}

/// Service fronting the engine and the workflow repository.
pub struct WorkflowService<R: WorkflowRepository> {
    engine: Arc<WorkflowEngine<R>>,
    default_step_timeout: u64,
}

impl<R: WorkflowRepository + 'static> WorkflowService<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>, config: &EngineConfig) -> Self {
        Self {
            engine,
            default_step_timeout: config.default_step_timeout_secs,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<R>> {
        &self.engine
    }

    fn repo(&self) -> &R {
        self.engine.repository()
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn get_workflow(&self, workflow: &WorkflowRef) -> Result<Workflow, ServiceError> {
        let found = match workflow {
            WorkflowRef::Id(id) => self.repo().get_workflow(id).await?,
            WorkflowRef::Code(code) => self.repo().get_workflow_by_code(code).await?,
        };
        found.ok_or_else(|| ServiceError::WorkflowNotFound(workflow.clone()))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, ServiceError> {
        Ok(self.repo().list_workflows().await?)
    }

    /// A workflow and its steps in `order`.
    pub async fn workflow_detail(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<(Workflow, Vec<WorkflowStep>), ServiceError> {
        let workflow = self.get_workflow(workflow).await?;
        let steps = self.repo().list_steps(&workflow.id).await?;
        Ok((workflow, steps))
    }

    /// Persist a parsed definition.
    ///
    /// Re-importing an existing code keeps the workflow's ID and statistics
    /// and replaces its steps.
    pub async fn import_definition(
        &self,
        file: WorkflowFile,
    ) -> Result<(Workflow, Vec<WorkflowStep>), ServiceError> {
        let existing = self.repo().get_workflow_by_code(&file.code).await?;
        let (workflow, steps) = file.into_records(existing.as_ref(), self.default_step_timeout)?;

        self.repo().save_workflow(&workflow).await?;
        self.repo().replace_steps(&workflow.id, &steps).await?;

        tracing::info!(
            workflow = %workflow.code,
            steps = steps.len(),
            updated = existing.is_some(),
            "workflow definition imported"
        );
        Ok((workflow, steps))
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// Run a workflow to completion and return the finished execution.
    pub async fn execute_workflow(
        &self,
        workflow: &WorkflowRef,
        input: Value,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
    ) -> Result<WorkflowExecution, ServiceError> {
        let workflow = self.get_workflow(workflow).await?;
        Ok(self
            .engine
            .execute(&workflow, input, triggered_by, trigger_type)
            .await?)
    }

    /// Start a workflow in the background.
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowRef,
        input: Value,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
    ) -> Result<ExecutionHandle, ServiceError> {
        let workflow = self.get_workflow(workflow).await?;
        Ok(self
            .engine
            .execute_async(workflow, input, triggered_by, trigger_type)?)
    }

    pub async fn cancel(&self, execution_id: &Uuid) -> Result<WorkflowExecution, ServiceError> {
        Ok(self.engine.cancel(execution_id).await?)
    }

    pub async fn retry(&self, execution_id: &Uuid) -> Result<WorkflowExecution, ServiceError> {
        Ok(self.engine.retry(execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Find an execution by record ID or by its `execution_id` key.
    pub async fn find_execution(&self, key: &str) -> Result<WorkflowExecution, ServiceError> {
        let found = match Uuid::parse_str(key) {
            Ok(id) => self.repo().get_execution(&id).await?,
            Err(_) => self.repo().get_execution_by_key(key).await?,
        };
        found.ok_or_else(|| ServiceError::ExecutionNotFound(key.to_string()))
    }

    pub async fn execution_report(&self, execution_id: &Uuid) -> Result<ExecutionReport, ServiceError> {
        let execution = self
            .repo()
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::ExecutionNotFound(execution_id.to_string()))?;
        let steps = self.repo().list_step_executions(execution_id).await?;
        Ok(ExecutionReport { execution, steps })
    }

    pub async fn list_executions(
        &self,
        workflow: Option<&WorkflowRef>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, ServiceError> {
        let workflow_id = match workflow {
            Some(r) => Some(self.get_workflow(r).await?.id),
            None => None,
        };
        Ok(self.repo().list_executions(workflow_id.as_ref(), limit).await?)
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Attach a recurring trigger to a workflow. The first run is computed
    /// immediately, so an invalid spec is rejected here.
    pub async fn add_schedule(
        &self,
        workflow: &WorkflowRef,
        name: &str,
        spec: ScheduleSpec,
        input: Value,
    ) -> Result<WorkflowSchedule, ServiceError> {
        let workflow = self.get_workflow(workflow).await?;
        let first = next_run_after(&spec, Utc::now())?;

        let mut schedule = WorkflowSchedule::new(workflow.id, name, spec);
        schedule.input_data = input;
        schedule.next_run_at = Some(first);
        self.repo().save_schedule(&schedule).await?;

        tracing::info!(
            workflow = %workflow.code,
            schedule = %schedule.name,
            next_run_at = %first,
            "schedule added"
        );
        Ok(schedule)
    }

    pub async fn list_schedules(
        &self,
        workflow: Option<&WorkflowRef>,
    ) -> Result<Vec<WorkflowSchedule>, ServiceError> {
        let workflow_id = match workflow {
            Some(r) => Some(self.get_workflow(r).await?.id),
            None => None,
        };
        Ok(self.repo().list_schedules(workflow_id.as_ref()).await?)
    }

    /// Pause or resume a schedule. Resuming recomputes `next_run_at` from now.
    pub async fn set_schedule_active(
        &self,
        schedule_id: &Uuid,
        active: bool,
    ) -> Result<WorkflowSchedule, ServiceError> {
        let mut schedule = self
            .repo()
            .get_schedule(schedule_id)
            .await?
            .ok_or(ServiceError::ScheduleNotFound(*schedule_id))?;
        schedule.is_active = active;
        schedule.next_run_at = if active {
            Some(next_run_after(&schedule.spec, Utc::now())?)
        } else {
            None
        };
        self.repo().save_schedule(&schedule).await?;
        Ok(schedule)
    }

    pub async fn remove_schedule(&self, schedule_id: &Uuid) -> Result<(), ServiceError> {
        if self.repo().delete_schedule(schedule_id).await? {
            Ok(())
        } else {
            Err(ServiceError::ScheduleNotFound(*schedule_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tradeflow_types::workflow::{ExecutionStatus, StepExecutionStatus};

    use crate::event::EventBus;
    use crate::repository::InMemoryWorkflowRepository;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::executor::ExecutorRegistry;

    const ORDER_EXPORT: &str = r#"
code: order_export
name: Order Export
retry_delay_seconds: 0
steps:
  - name: shape
    type: data_transform
    config:
      mappings:
        order: order_id
  - name: check
    type: data_validate
    depends_on: [shape]
    config:
      input_mapping:
        order: steps.shape.order
      required: [order]
"#;

    fn service() -> WorkflowService<InMemoryWorkflowRepository> {
        let config = EngineConfig::default();
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(ExecutorRegistry::with_builtins()),
            &config,
            EventBus::default(),
        ));
        WorkflowService::new(engine, &config)
    }

    #[test]
    fn test_workflow_ref_from_str() {
        let id = Uuid::now_v7();
        assert_eq!(id.to_string().parse::<WorkflowRef>().unwrap(), WorkflowRef::Id(id));
        assert_eq!(
            "order_export".parse::<WorkflowRef>().unwrap(),
            WorkflowRef::Code("order_export".to_string())
        );
    }

    #[tokio::test]
    async fn test_import_then_execute_by_code() {
        let svc = service();
        let (workflow, steps) = svc
            .import_definition(parse_workflow_yaml(ORDER_EXPORT).unwrap())
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);

        let code = WorkflowRef::Code("order_export".to_string());
        let execution = svc
            .execute_workflow(&code, json!({"order_id": 42}), Some("cli".to_string()), TriggerType::Manual)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let report = svc.execution_report(&execution.id).await.unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|s| s.status == StepExecutionStatus::Completed));
        assert_eq!(report.steps[0].step_name, "shape");

        let by_key = svc.find_execution(&execution.execution_id).await.unwrap();
        assert_eq!(by_key.id, execution.id);

        let stats = svc.get_workflow(&WorkflowRef::Id(workflow.id)).await.unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 1);
    }

    #[tokio::test]
    async fn test_reimport_replaces_steps() {
        let svc = service();
        let (first, _) = svc
            .import_definition(parse_workflow_yaml(ORDER_EXPORT).unwrap())
            .await
            .unwrap();

        let trimmed = "code: order_export\nname: Order Export v2\nsteps:\n  - name: only\n    type: data_transform\n";
        let (second, steps) = svc
            .import_definition(parse_workflow_yaml(trimmed).unwrap())
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Order Export v2");
        assert_eq!(steps.len(), 1);
        let (_, stored) = svc.workflow_detail(&WorkflowRef::Id(first.id)).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let svc = service();
        let err = svc
            .execute_workflow(&WorkflowRef::Code("ghost".to_string()), json!({}), None, TriggerType::Api)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let svc = service();
        svc.import_definition(parse_workflow_yaml(ORDER_EXPORT).unwrap())
            .await
            .unwrap();
        let handle = svc
            .submit_workflow(
                &WorkflowRef::Code("order_export".to_string()),
                json!({"order_id": 7}),
                None,
                TriggerType::Api,
            )
            .await
            .unwrap();
        let execution = handle.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.trigger_type, TriggerType::Api);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let svc = service();
        svc.import_definition(parse_workflow_yaml(ORDER_EXPORT).unwrap())
            .await
            .unwrap();
        let code = WorkflowRef::Code("order_export".to_string());

        let schedule = svc
            .add_schedule(&code, "hourly", ScheduleSpec::Interval { seconds: 3600 }, json!({}))
            .await
            .unwrap();
        assert!(schedule.next_run_at.unwrap() > Utc::now());
        assert_eq!(svc.list_schedules(Some(&code)).await.unwrap().len(), 1);

        let paused = svc.set_schedule_active(&schedule.id, false).await.unwrap();
        assert!(!paused.is_active);
        assert!(paused.next_run_at.is_none());

        svc.remove_schedule(&schedule.id).await.unwrap();
        assert!(svc.list_schedules(None).await.unwrap().is_empty());
        assert!(matches!(
            svc.remove_schedule(&schedule.id).await.unwrap_err(),
            ServiceError::ScheduleNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let svc = service();
        svc.import_definition(parse_workflow_yaml(ORDER_EXPORT).unwrap())
            .await
            .unwrap();
        let err = svc
            .add_schedule(
                &WorkflowRef::Code("order_export".to_string()),
                "bad",
                ScheduleSpec::Interval { seconds: 0 },
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Scheduler(_)));
    }
}
