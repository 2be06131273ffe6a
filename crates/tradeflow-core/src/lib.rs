//! Workflow orchestration logic and repository trait definitions for Tradeflow.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine that runs workflows against them. It
//! depends only on `tradeflow-types` -- never on `tradeflow-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;
