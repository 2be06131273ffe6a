//! Shared domain types for Tradeflow.
//!
//! This crate contains the domain types used across the Tradeflow workflow
//! engine: workflows, steps, execution records, schedules, engine events,
//! configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
