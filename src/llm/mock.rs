//! Deterministic offline backend.
//!
//! For every source in the prompt it emits one fact whose statement is the
//! first sentence of the text (capped at 60 words) and whose quote is the
//! first 200 characters. Good enough to exercise the full pipeline without
//! network access; useless for real extraction.

use async_trait::async_trait;
use serde_json::json;

use super::{CompletionRequest, ModelClient, ModelError};
use crate::schema::MAX_STATEMENT_CHARS;

const MAX_STATEMENT_WORDS: usize = 60;
const MAX_QUOTE_CHARS: usize = 200;

#[derive(Debug, Default, Clone)]
pub struct MockClient;

impl MockClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn backend_name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let facts: Vec<serde_json::Value> = request
            .prompt
            .sources
            .iter()
            .filter_map(|source| {
                let statement = first_sentence(&source.text);
                if statement.is_empty() {
                    return None;
                }
                let quote: String = source.text.trim().chars().take(MAX_QUOTE_CHARS).collect();
                Some(json!({
                    "statement": statement,
                    "sources": [{"source_id": source.source_id, "quote": quote}],
                }))
            })
            .collect();

        Ok(json!({ "facts": facts }).to_string())
    }
}

/// First sentence of `text`, whitespace-collapsed and capped.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace; that
/// terminator is dropped. Punctuation inside a token ("2.5", "a.b/c") or at
/// the very end of the text does not split.
fn first_sentence(text: &str) -> String {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    let mut end = text.len();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(false, |&(_, next)| next.is_whitespace())
        {
            end = i;
            break;
        }
    }

    let words: Vec<&str> = text[..end].split_whitespace().take(MAX_STATEMENT_WORDS).collect();
    words
        .join(" ")
        .chars()
        .take(MAX_STATEMENT_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}
