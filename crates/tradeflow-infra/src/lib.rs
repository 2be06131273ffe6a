//! Infrastructure layer for Tradeflow.
//!
//! Implements the ports defined in `tradeflow-core`: the SQLite
//! `WorkflowRepository`, the I/O-backed step executors (HTTP, AI, SQL,
//! signed webhooks), plus config loading and the data directory layout.

pub mod config;
pub mod executor;
pub mod filesystem;
pub mod sqlite;
