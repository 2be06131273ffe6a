//! Step executor capability interface and registry.
//!
//! Follows the same blanket-impl pattern as the other pluggable seams:
//! 1. `StepExecutor` is the ergonomic trait with native async fn
//! 2. `StepExecutorDyn` is the object-safe form with boxed futures
//! 3. `ExecutorRegistry` maps a `StepKind` to an `Arc<dyn StepExecutorDyn>`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tradeflow_types::workflow::{StepKind, WorkflowStep};
use uuid::Uuid;

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Everything an executor sees for one attempt.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: Uuid,
    pub step: WorkflowStep,
    /// Input resolved from `default_inputs` and `input_mapping`.
    pub input: Value,
    /// Snapshot of the execution context taken before the step started.
    pub context: ExecutionContext,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fired when the execution is cancelled or a parallel sibling fails.
    pub cancel: CancellationToken,
}

/// Result of a successful attempt.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub output: Value,
    pub metrics: HashMap<String, f64>,
    /// Top-level keys merged into the execution context.
    pub context_updates: Map<String, Value>,
}

impl StepOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors raised by a single step attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid step input: {0}")]
    InvalidInput(String),

    #[error("no executor registered for step type '{0}'")]
    Unregistered(String),

    #[error("step timed out after {0}s")]
    Timeout(u64),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Short machine-readable tag stored in `error_details`.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::ExecutionFailed(_) => "execution_failed",
            StepError::InvalidInput(_) => "invalid_input",
            StepError::Unregistered(_) => "unregistered",
            StepError::Timeout(_) => "timeout",
            StepError::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A capability that can execute one kind of step.
///
/// Implementations should check `request.cancel` at their await points.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, request: &StepRequest) -> impl Future<Output = Result<StepOutcome, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// Identity executor: echoes its input as output.
///
/// Stands in for unregistered custom kinds when the registry is permissive.
pub struct PassthroughExecutor;

impl StepExecutor for PassthroughExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        tracing::warn!(
            step = %request.step.name,
            step_type = %request.step.step_type,
            "no executor registered, passing input through"
        );
        Ok(StepOutcome::new(request.input.clone()))
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Registry of step executors, indexed by step kind.
///
/// Built-in kinds and `Custom(name)` plugins share one table populated at
/// startup.
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutorDyn>>,
    allow_unregistered_custom: bool,
}

impl ExecutorRegistry {
    /// Create an empty registry that rejects unregistered kinds.
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            allow_unregistered_custom: false,
        }
    }

    /// Create a registry with the pure built-in executors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Let unregistered `Custom` kinds fall back to [`PassthroughExecutor`].
    pub fn allow_unregistered_custom(mut self, allow: bool) -> Self {
        self.allow_unregistered_custom = allow;
        self
    }

    /// Register an executor for `kind`, replacing any previous one.
    pub fn register<E: StepExecutor + 'static>(&mut self, kind: StepKind, executor: E) {
        self.executors.insert(kind, Arc::new(executor));
    }

    /// Register a plugin under a custom step type name.
    pub fn register_custom<E: StepExecutor + 'static>(&mut self, name: impl Into<String>, executor: E) {
        self.register(StepKind::Custom(name.into()), executor);
    }

    pub fn contains(&self, kind: &StepKind) -> bool {
        self.executors.contains_key(kind)
    }

    /// Find the executor for `kind`.
    pub fn resolve(&self, kind: &StepKind) -> Result<Arc<dyn StepExecutorDyn>, StepError> {
        if let Some(executor) = self.executors.get(kind) {
            return Ok(Arc::clone(executor));
        }
        match kind {
            StepKind::Custom(_) if self.allow_unregistered_custom => Ok(Arc::new(PassthroughExecutor)),
            other => Err(StepError::Unregistered(other.to_string())),
        }
    }

    /// Registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .field("allow_unregistered_custom", &self.allow_unregistered_custom)
            .finish()
    }
}
