//! Shared domain types for Sagaflow.
//!
//! This crate contains the domain types used across the workflow engine:
//! workflow executions and step records, workflow/step definitions, retry
//! policies, the classified `StepError`, the queue job envelope, engine
//! configuration, and the repository/queue error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod job;
pub mod retry;
pub mod step;
pub mod workflow;
