//! Core data models used throughout the knowledge builder.
//!
//! These types represent the messages read from the source table, the
//! candidate facts returned by the model, and the accepted facts that are
//! appended to `knowledge.jsonl`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix used when presenting a message to the model (`msg:<id>`).
pub const SOURCE_ID_PREFIX: &str = "msg:";

/// One row read from the source table. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_title: Option<String>,
}

impl Message {
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            date: None,
            topic_id: None,
            topic_title: None,
        }
    }

    /// The id under which the model sees this message.
    pub fn source_id(&self) -> String {
        format!("{}{}", SOURCE_ID_PREFIX, self.id)
    }
}

/// Parse a `msg:<digits>` source id back into a message id.
pub fn parse_source_id(source_id: &str) -> Option<i64> {
    let digits = source_id.trim().strip_prefix(SOURCE_ID_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A quoted excerpt grounding a fact in one source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub quote: String,
}

/// A fact as returned by the model after shape validation, before
/// deduplication and metadata derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub statement: String,
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Derived metadata attached to an accepted fact.
///
/// Never part of the fact hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactMeta {
    /// Extraction timestamp (RFC 3339, UTC).
    pub ts: String,
    /// Sorted, unique numeric message ids, comma-joined.
    pub source_ids_csv: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_max: Option<String>,
    /// Present only when every dated source shares one topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_titles: Vec<String>,
}

/// An accepted, deduplicated fact. One line of `knowledge.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub statement: String,
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub hash: String,
    pub meta: FactMeta,
}

/// Which configured model produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Fallback,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRole::Primary => write!(f, "primary"),
            ModelRole::Fallback => write!(f, "fallback"),
        }
    }
}

/// Aggregate counters for one run. Printed once, never persisted as state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batches: u64,
    pub accepted_facts: u64,
    pub empty_batches: u64,
    pub errors: u64,
    pub last_id: i64,
    pub duplicates_skipped: u64,
}
