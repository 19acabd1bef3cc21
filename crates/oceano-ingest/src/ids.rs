//! Deterministic identifiers derived from `(path, mtime)`.
//!
//! Re-ingesting an unchanged file reproduces the same index point id, so an
//! upsert after a crash overwrites instead of duplicating.

use sha2::{Digest, Sha256};
use uuid::Uuid;

fn id_key(path: &str, mtime: f64) -> String {
    format!("{path}:{mtime}")
}

/// Index point id for a file version.
pub fn external_id(path: &str, mtime: f64) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, id_key(path, mtime).as_bytes())
}

/// Thumbnail file stem for a file version (lowercase hex SHA-256).
pub fn thumb_id(path: &str, mtime: f64) -> String {
    let digest = Sha256::digest(id_key(path, mtime).as_bytes());
    format!("{digest:x}")
}
