//! Start-request deduplication.
//!
//! A workflow's dedup key is `(workflow_type, org_id, user_id, args_hash)`
//! where `args_hash` is a content digest of the serialized start input. The
//! `ContentHasher` port keeps the digest algorithm out of core; the SHA-256
//! adapter lives in sagaflow-infra.

use serde_json::Value;

/// Abstraction over content hashing for dedup keys.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}

/// Compute the dedup hash of a start input.
///
/// `serde_json` objects serialize with sorted keys, so logically equal inputs
/// hash identically regardless of field order.
pub fn args_hash(hasher: &impl ContentHasher, input: &Value) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_string(input)?;
    Ok(hasher.compute_hash(&canonical))
}

/// Treat empty identifiers as absent.
pub fn normalize_id(id: Option<&str>) -> Option<&str> {
    id.filter(|s| !s.trim().is_empty())
}
