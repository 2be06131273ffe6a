//! Workflow engine core: definitions, batch planning, step execution and scheduling.
//!
//! - `definition` -- YAML parsing and conversion to workflow/step records
//! - `dag` -- batch planning and dependency validation
//! - `context` -- execution context, input mapping and template rendering
//! - `expression` -- JEXL evaluator used by step conditions
//! - `condition` -- step condition evaluation
//! - `executor` -- step executor trait and registry
//! - `builtin` -- executors that need no external services
//! - `retry` -- per-step retry policy
//! - `step_runner` -- runs one step: dependencies, condition, retries, timeout
//! - `engine` -- runs whole executions and owns their lifecycle
//! - `scheduler` -- recurring triggers

pub mod builtin;
pub mod condition;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod scheduler;
pub mod step_runner;
