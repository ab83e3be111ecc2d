//! Response parsing and strict-shape validation.
//!
//! The model is asked for `{"facts": [...]}`; a bare top-level list is also
//! accepted. Validation never stops at the first problem: every violation is
//! collected into a [`ValidationReport`], because the report is what the
//! repair prompt shows back to the model.
//!
//! Shape rules per element:
//!
//! - `statement`: string, 1..=[`MAX_STATEMENT_CHARS`] chars after trimming
//! - `sources`: non-empty list of `{source_id, quote}`, both non-empty strings
//! - `category`: optional string (`null` is treated as absent)
//!
//! [`check_grounding`] adds the batch-aware rule that every `source_id`
//! names a message of the current batch.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::fact_hash::normalize_statement;
use crate::models::{parse_source_id, CandidateFact, SourceRef};

/// Upper bound on statement length, in characters.
pub const MAX_STATEMENT_CHARS: usize = 400;

/// One violation, addressed by a JSON-path-like location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All violations found in one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn single(path: &str, message: &str) -> Self {
        Self {
            issues: vec![ValidationIssue::new(path, message)],
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "; {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

/// Why a raw response could not be accepted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResponseError {
    #[error("response is not well-formed JSON: {0}")]
    Parse(String),
    #[error("response failed validation: {0}")]
    Invalid(ValidationReport),
}

impl ResponseError {
    /// Flat, human-readable problem list for audit records and repair prompts.
    pub fn messages(&self) -> Vec<String> {
        match self {
            ResponseError::Parse(e) => vec![format!("output is not valid JSON ({})", e)],
            ResponseError::Invalid(report) => {
                report.issues.iter().map(|i| i.to_string()).collect()
            }
        }
    }
}

/// Strip a surrounding markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let inner = trimmed.trim_start_matches('`');
    let inner = inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner);
    inner.trim_end().trim_end_matches('`').trim()
}

/// Parse raw model text into JSON.
pub fn parse_response(raw: &str) -> Result<Value, ResponseError> {
    let body = strip_code_fences(raw);
    if body.is_empty() {
        return Err(ResponseError::Parse("empty response".to_string()));
    }
    serde_json::from_str(body).map_err(|e| ResponseError::Parse(e.to_string()))
}

/// Validate a parsed response and convert it into candidate facts.
///
/// An empty list is a valid "nothing found" answer.
pub fn validate(value: &Value) -> Result<Vec<CandidateFact>, ValidationReport> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("facts") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(ValidationReport::single("facts", "must be a list")),
            None => {
                return Err(ValidationReport::single(
                    "$",
                    "top-level value must be a list of facts or an object with a `facts` list",
                ))
            }
        },
        _ => {
            return Err(ValidationReport::single(
                "$",
                "top-level value must be a list of facts or an object with a `facts` list",
            ))
        }
    };

    let mut issues = Vec::new();
    let mut facts = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let path = format!("facts[{}]", i);
        let before = issues.len();

        let Some(obj) = item.as_object() else {
            issues.push(ValidationIssue::new(&path, "must be an object"));
            continue;
        };

        let statement = match obj.get("statement") {
            Some(Value::String(s)) => {
                let s = s.trim();
                let len = s.chars().count();
                if len == 0 {
                    issues.push(ValidationIssue::new(
                        format!("{}.statement", path),
                        "must not be empty",
                    ));
                } else if len > MAX_STATEMENT_CHARS {
                    issues.push(ValidationIssue::new(
                        format!("{}.statement", path),
                        format!(
                            "must be at most {} characters (got {})",
                            MAX_STATEMENT_CHARS, len
                        ),
                    ));
                }
                s.to_string()
            }
            Some(_) => {
                issues.push(ValidationIssue::new(
                    format!("{}.statement", path),
                    "must be a string",
                ));
                String::new()
            }
            None => {
                issues.push(ValidationIssue::new(
                    format!("{}.statement", path),
                    "is required",
                ));
                String::new()
            }
        };

        let sources = match obj.get("sources") {
            Some(Value::Array(list)) if list.is_empty() => {
                issues.push(ValidationIssue::new(
                    format!("{}.sources", path),
                    "must contain at least one source",
                ));
                Vec::new()
            }
            Some(Value::Array(list)) => validate_sources(&path, list, &mut issues),
            Some(_) => {
                issues.push(ValidationIssue::new(
                    format!("{}.sources", path),
                    "must be a list",
                ));
                Vec::new()
            }
            None => {
                issues.push(ValidationIssue::new(
                    format!("{}.sources", path),
                    "is required",
                ));
                Vec::new()
            }
        };

        let category = match obj.get("category") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Some(_) => {
                issues.push(ValidationIssue::new(
                    format!("{}.category", path),
                    "must be a string when present",
                ));
                None
            }
        };

        if issues.len() == before {
            facts.push(CandidateFact {
                statement,
                sources,
                category,
            });
        }
    }

    if issues.is_empty() {
        Ok(facts)
    } else {
        Err(ValidationReport { issues })
    }
}

fn validate_sources(
    fact_path: &str,
    list: &[Value],
    issues: &mut Vec<ValidationIssue>,
) -> Vec<SourceRef> {
    let mut sources = Vec::with_capacity(list.len());
    for (j, entry) in list.iter().enumerate() {
        let path = format!("{}.sources[{}]", fact_path, j);
        let Some(obj) = entry.as_object() else {
            issues.push(ValidationIssue::new(&path, "must be an object"));
            continue;
        };
        let source_id = required_string(obj.get("source_id"), &format!("{}.source_id", path), issues);
        let quote = required_string(obj.get("quote"), &format!("{}.quote", path), issues);
        if let (Some(source_id), Some(quote)) = (source_id, quote) {
            sources.push(SourceRef { source_id, quote });
        }
    }
    sources
}

fn required_string(
    value: Option<&Value>,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::String(_)) => {
            issues.push(ValidationIssue::new(path, "must not be empty"));
            None
        }
        Some(_) => {
            issues.push(ValidationIssue::new(path, "must be a string"));
            None
        }
        None => {
            issues.push(ValidationIssue::new(path, "is required"));
            None
        }
    }
}

/// Check that every source id names a message of the current batch.
///
/// `batch_texts` maps `msg:<id>` to the message text. Quotes that do not
/// appear in the text (after case-folding and whitespace collapse) are only
/// logged: near-verbatim quotes are acceptable.
pub fn check_grounding(
    facts: &[CandidateFact],
    batch_texts: &HashMap<String, &str>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (i, fact) in facts.iter().enumerate() {
        for (j, source) in fact.sources.iter().enumerate() {
            let path = format!("facts[{}].sources[{}].source_id", i, j);
            if parse_source_id(&source.source_id).is_none() {
                issues.push(ValidationIssue::new(
                    path,
                    format!("`{}` must have the form msg:<id>", source.source_id),
                ));
                continue;
            }
            match batch_texts.get(source.source_id.as_str()) {
                None => issues.push(ValidationIssue::new(
                    path,
                    format!(
                        "`{}` does not refer to a message in this batch",
                        source.source_id
                    ),
                )),
                Some(text) => {
                    if !normalize_statement(text).contains(&normalize_statement(&source.quote)) {
                        debug!(
                            source_id = %source.source_id,
                            quote = %source.quote,
                            "quote is not verbatim in source text"
                        );
                    }
                }
            }
        }
    }
    issues
}

/// Parse, validate, and ground one raw response.
pub fn accept_response(
    raw: &str,
    batch_texts: &HashMap<String, &str>,
) -> Result<Vec<CandidateFact>, ResponseError> {
    let value = parse_response(raw)?;
    let facts = validate(&value).map_err(ResponseError::Invalid)?;
    let issues = check_grounding(&facts, batch_texts);
    if issues.is_empty() {
        Ok(facts)
    } else {
        Err(ResponseError::Invalid(ValidationReport { issues }))
    }
}

/// JSON Schema of the expected response object.
pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["facts"],
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["statement", "sources"],
                    "properties": {
                        "statement": {
                            "type": "string",
                            "minLength": 1,
                            "maxLength": MAX_STATEMENT_CHARS
                        },
                        "sources": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["source_id", "quote"],
                                "properties": {
                                    "source_id": { "type": "string", "pattern": "^msg:[0-9]+$" },
                                    "quote": { "type": "string", "minLength": 1 }
                                }
                            }
                        },
                        "category": { "type": "string" }
                    }
                }
            }
        }
    })
}
