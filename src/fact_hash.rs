//! Stable content hashing for fact deduplication.
//!
//! The hash covers only the semantically meaningful parts of a fact: the
//! statement (case-folded, whitespace-collapsed) and the sorted set of
//! source ids. Quotes, category, and all derived metadata are excluded, so
//! two runs that extract the same claim from the same messages collide even
//! when the model's surrounding output differs.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::models::{CandidateFact, SourceRef};

/// Case-fold and collapse all whitespace runs to a single space.
pub fn normalize_statement(statement: &str) -> String {
    statement
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 over `normalized statement | sorted unique source ids`, as 64 hex chars.
pub fn hash_fact(statement: &str, sources: &[SourceRef]) -> String {
    let ids: BTreeSet<&str> = sources.iter().map(|s| s.source_id.trim()).collect();
    let ids = ids.into_iter().collect::<Vec<_>>().join(",");

    let mut hasher = Sha256::new();
    hasher.update(normalize_statement(statement).as_bytes());
    hasher.update(b"|");
    hasher.update(ids.as_bytes());
    hex::encode(hasher.finalize())
}

impl CandidateFact {
    pub fn stable_hash(&self) -> String {
        hash_fact(&self.statement, &self.sources)
    }
}
