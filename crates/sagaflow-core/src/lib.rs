//! Workflow orchestration logic and port definitions for Sagaflow.
//!
//! This crate defines the "ports" (repository, job queue, hashing, step
//! handler traits) that the infrastructure layer implements, and the engine
//! that drives workflows through them. It depends only on `sagaflow-types` --
//! never on `sagaflow-infra` or any database/IO crate.

pub mod dedup;
pub mod queue;
pub mod repository;
pub mod signup;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
