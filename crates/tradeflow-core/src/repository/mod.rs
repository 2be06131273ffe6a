//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (tradeflow-infra) implements. The core crate never depends on any
//! specific storage technology. An in-memory implementation lives here for
//! tests and embedding.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::WorkflowRepository;
