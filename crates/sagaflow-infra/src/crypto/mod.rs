//! Cryptographic operations for Sagaflow.
//!
//! - `hash`: SHA-256 digests of start inputs for request deduplication

pub mod hash;
