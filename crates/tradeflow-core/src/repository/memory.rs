//! In-memory `WorkflowRepository` for tests and embedding.
//!
//! All state sits behind one `std::sync::Mutex`; no lock is held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tradeflow_types::error::RepositoryError;
use tradeflow_types::workflow::{
    ExecutionStatus, Workflow, WorkflowExecution, WorkflowSchedule, WorkflowStep,
    WorkflowStepExecution,
};
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, Workflow>,
    steps: HashMap<Uuid, WorkflowStep>,
    executions: HashMap<Uuid, WorkflowExecution>,
    step_executions: HashMap<Uuid, WorkflowStepExecution>,
    schedules: HashMap<Uuid, WorkflowSchedule>,
}

/// Process-local repository backed by hash maps.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: Mutex<State>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Query("repository lock poisoned".to_string()))
    }
}

fn is_open(status: ExecutionStatus) -> bool {
    matches!(status, ExecutionStatus::Pending | ExecutionStatus::Running)
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state
            .workflows
            .values()
            .any(|w| w.code == workflow.code && w.id != workflow.id)
        {
            return Err(RepositoryError::Conflict(format!(
                "workflow code '{}' already exists",
                workflow.code
            )));
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.lock()?.workflows.get(id).cloned())
    }

    async fn get_workflow_by_code(&self, code: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self
            .lock()?
            .workflows
            .values()
            .find(|w| w.code == code)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut workflows: Vec<Workflow> = self.lock()?.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        if state.executions.values().any(|e| e.workflow_id == *id) {
            return Err(RepositoryError::Conflict(
                "workflow has executions".to_string(),
            ));
        }
        state.steps.retain(|_, s| s.workflow_id != *id);
        state.schedules.retain(|_, s| s.workflow_id != *id);
        Ok(state.workflows.remove(id).is_some())
    }

    async fn record_execution_outcome(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_seconds: Option<f64>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let workflow = state
            .workflows
            .get_mut(workflow_id)
            .ok_or(RepositoryError::NotFound)?;
        workflow.record_outcome(success, duration_seconds);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn save_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        self.lock()?.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn replace_steps(
        &self,
        workflow_id: &Uuid,
        steps: &[WorkflowStep],
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state.steps.retain(|_, s| s.workflow_id != *workflow_id);
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let mut steps: Vec<WorkflowStep> = self
            .lock()?
            .steps
            .values()
            .filter(|s| s.workflow_id == *workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.executions.contains_key(&execution.id)
            || state
                .executions
                .values()
                .any(|e| e.execution_id == execution.execution_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "execution '{}' already exists",
                execution.execution_id
            )));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.lock()?.executions.get(id).cloned())
    }

    async fn get_execution_by_key(
        &self,
        key: &str,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self
            .lock()?
            .executions
            .values()
            .find(|e| e.execution_id == key)
            .cloned())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        match state.executions.get_mut(&execution.id) {
            Some(stored) if is_open(stored.status) => {
                *stored = execution.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_current_step(&self, execution_id: &Uuid, step_id: &Uuid) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if let Some(stored) = state.executions.get_mut(execution_id) {
            if is_open(stored.status) {
                stored.current_step = Some(*step_id);
            }
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut executions: Vec<WorkflowExecution> = self
            .lock()?
            .executions
            .values()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == *id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        executions.truncate(limit as usize);
        Ok(executions)
    }

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    async fn create_step_execution(&self, record: &WorkflowStepExecution) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state
            .step_executions
            .values()
            .any(|r| r.execution_id == record.execution_id && r.step_id == record.step_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "step '{}' already has a record in this execution",
                record.step_name
            )));
        }
        state.step_executions.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_step_execution(&self, record: &WorkflowStepExecution) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let stored = state
            .step_executions
            .get_mut(&record.id)
            .ok_or(RepositoryError::NotFound)?;
        *stored = record.clone();
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<WorkflowStepExecution>, RepositoryError> {
        let mut records: Vec<WorkflowStepExecution> = self
            .lock()?
            .step_executions
            .values()
            .filter(|r| r.execution_id == *execution_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.execution_order, r.id));
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    async fn save_schedule(&self, schedule: &WorkflowSchedule) -> Result<(), RepositoryError> {
        self.lock()?.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &Uuid) -> Result<Option<WorkflowSchedule>, RepositoryError> {
        Ok(self.lock()?.schedules.get(id).cloned())
    }

    async fn list_schedules(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let mut schedules: Vec<WorkflowSchedule> = self
            .lock()?
            .schedules
            .values()
            .filter(|s| workflow_id.is_none_or(|id| s.workflow_id == *id))
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let mut due: Vec<WorkflowSchedule> = self
            .lock()?
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        id: &Uuid,
        ran_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let schedule = state.schedules.get_mut(id).ok_or(RepositoryError::NotFound)?;
        schedule.last_run_at = Some(ran_at);
        schedule.total_runs += 1;
        schedule.next_run_at = next;
        Ok(())
    }

    async fn delete_schedule(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.lock()?.schedules.remove(id).is_some())
    }
}
