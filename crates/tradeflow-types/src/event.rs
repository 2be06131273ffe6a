//! Event types for the Tradeflow workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the engine while executions progress.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::TriggerType;

/// Events emitted during workflow execution.
///
/// Consumed by progress displays, logging, and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution moved to running.
    ExecutionStarted {
        execution_id: Uuid,
        execution_key: String,
        workflow_code: String,
        trigger_type: TriggerType,
        total_steps: u32,
    },

    /// A step attempt began.
    StepStarted {
        execution_id: Uuid,
        step_id: Uuid,
        step_name: String,
        attempt: u32,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: Uuid,
        step_name: String,
        duration_ms: u64,
    },

    /// An attempt failed and another will follow after the retry delay.
    StepRetrying {
        execution_id: Uuid,
        step_id: Uuid,
        step_name: String,
        attempt: u32,
        error: String,
    },

    StepFailed {
        execution_id: Uuid,
        step_id: Uuid,
        step_name: String,
        error: String,
        optional: bool,
    },

    StepSkipped {
        execution_id: Uuid,
        step_id: Uuid,
        step_name: String,
        reason: String,
    },

    /// Persisted after every batch.
    ExecutionProgress {
        execution_id: Uuid,
        completed_steps: u32,
        total_steps: u32,
    },

    ExecutionCompleted { execution_id: Uuid, duration_ms: u64 },

    ExecutionFailed { execution_id: Uuid, error: String },

    ExecutionCancelled { execution_id: Uuid },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepRetrying { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepSkipped { execution_id, .. }
            | WorkflowEvent::ExecutionProgress { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id } => *execution_id,
        }
    }
}
