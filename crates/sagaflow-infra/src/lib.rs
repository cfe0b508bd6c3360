//! Infrastructure layer for Sagaflow.
//!
//! Contains implementations of the ports defined in `sagaflow-core`: the
//! SQLite workflow repository, the SQLite-backed durable job queue and its
//! worker pool, SHA-256 dedup hashing, config loading, and the engine wiring
//! that ties them together.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod signup;
pub mod sqlite;
pub mod worker;
