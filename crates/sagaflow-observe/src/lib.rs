//! Observability setup for Sagaflow binaries.

pub mod tracing_setup;
