//! Content hashing for delivery de-duplication and validation caching.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Structural hash of a JSON payload.
///
/// Object keys serialize in sorted order, so payloads that differ only in
/// key order hash identically.
pub fn hash_payload(payload: &Value) -> String {
    hash_input(&payload.to_string())
}

/// Fingerprint for one dispatch attempt of a workflow step.
///
/// Format: `{workflow_id}:{step_id}:{attempt}:{hash16}`
pub fn step_fingerprint(workflow_id: &str, step_id: &str, attempt: u32, parameters: &Value) -> String {
    format!(
        "{}:{}:{}:{}",
        workflow_id,
        step_id,
        attempt,
        hash_payload(parameters)
    )
}
