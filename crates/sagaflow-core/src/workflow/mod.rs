//! Workflow engine: registry, dispatch, execution, and orchestration.

pub mod compensation;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod handler;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod runner;
