//! Content hashing for structural identity.
//!
//! Queries, generators and synthetic keys are identified by a SHA-256
//! digest of their canonical JSON form. Serde's struct-field ordering and
//! the BTree collections used throughout make the encoding deterministic.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of the abbreviated hash used in aliases and staging names.
pub const SHORT_HASH_LEN: usize = 8;

/// Hex SHA-256 of the value's JSON encoding (64 chars).
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Abbreviated content hash for human-visible identifiers.
pub fn short_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut full = content_hash(value)?;
    full.truncate(SHORT_HASH_LEN);
    Ok(full)
}
