//! Extraction and repair prompt assembly.
//!
//! [`build_prompt`] is a pure function of the batch, the free-text hints,
//! the response schema, and an optional repair context. It never talks to a
//! model, so the driver's state machine can be exercised with a scripted
//! client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::planner::Batch;
use crate::schema::{response_schema, MAX_STATEMENT_CHARS};

/// Longest slice of a rejected answer echoed back in a repair prompt.
const MAX_ECHOED_OUTPUT_BYTES: usize = 8_000;

const SYSTEM_PROMPT: &str = "You extract atomic, verifiable knowledge statements from chat messages.

Rules:
- Each statement is one self-contained assertion (a fact, number, date, rule, condition, \
decision, version, or change) that a reader could check against the sources.
- Every statement cites at least one source by its exact source_id and includes a short \
verbatim quote from that source's text.
- Never invent facts, never cite a source_id that was not provided, and skip greetings, \
questions, and chatter.
- Keep statements short and in the language of the sources.
- If nothing qualifies, return {\"facts\": []}.
- Answer with a single JSON object and nothing else.";

/// One message as presented to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSource {
    pub source_id: String,
    pub text: String,
}

/// Errors from a rejected answer, fed back to the same model.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub issues: &'a [String],
    pub invalid_output: &'a str,
}

/// Everything the model collaborator needs apart from sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPrompt {
    pub system: String,
    pub user: String,
    pub schema: Value,
    pub sources: Vec<PromptSource>,
}

/// Build the canonical extraction prompt, or a repair prompt when `repair`
/// is given.
pub fn build_prompt(
    batch: &Batch<'_>,
    hints: &str,
    repair: Option<&RepairContext<'_>>,
) -> ExtractionPrompt {
    let schema = response_schema();
    let sources: Vec<PromptSource> = batch
        .messages
        .iter()
        .map(|m| PromptSource {
            source_id: m.source_id(),
            text: m.text.clone(),
        })
        .collect();

    let mut user = String::new();
    user.push_str("Extract knowledge statements from the sources below.\n\n");

    let hints = hints.trim();
    if !hints.is_empty() {
        user.push_str("Additional guidance:\n");
        user.push_str(hints);
        user.push_str("\n\n");
    }

    user.push_str("Sources (one JSON object per line):\n");
    for source in &sources {
        // serde_json on a plain struct of strings cannot fail
        if let Ok(line) = serde_json::to_string(source) {
            user.push_str(&line);
            user.push('\n');
        }
    }

    user.push_str(&format!(
        "\nRespond with {{\"facts\": [{{\"statement\": ..., \"sources\": [{{\"source_id\": ..., \"quote\": ...}}], \"category\": ...}}]}}. \
statement is at most {} characters; category is optional.\nJSON Schema:\n{}\n",
        MAX_STATEMENT_CHARS,
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    ));

    if let Some(repair) = repair {
        user.push_str("\nYour previous answer was rejected.\nProblems:\n");
        for issue in repair.issues {
            user.push_str("- ");
            user.push_str(issue);
            user.push('\n');
        }
        user.push_str("\nPrevious answer:\n<<<\n");
        user.push_str(truncate_to_char_boundary(
            repair.invalid_output,
            MAX_ECHOED_OUTPUT_BYTES,
        ));
        user.push_str("\n>>>\n\nReturn only the corrected JSON object, with no commentary.\n");
    }

    ExtractionPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        schema,
        sources,
    }
}

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::planner::{plan, BatchLimits};

    fn msgs() -> Vec<Message> {
        vec![
            Message::new(1, "The service times out after 30s"),
            Message::new(2, "Use \"v2\" endpoints only"),
        ]
    }

    fn one_batch(messages: &[Message]) -> Batch<'_> {
        let limits = BatchLimits {
            token_budget: 10_000,
            per_message_overhead: 0,
            max_messages: 10,
        };
        plan(messages, limits).next().unwrap()
    }

    #[test]
    fn prompt_lists_every_source_once_in_order() {
        let m = msgs();
        let p = build_prompt(&one_batch(&m), "", None);
        assert_eq!(p.sources.len(), 2);
        assert_eq!(p.sources[0].source_id, "msg:1");
        let first = p.user.find("\"msg:1\"").unwrap();
        let second = p.user.find("\"msg:2\"").unwrap();
        assert!(first < second);
        assert!(p.user.contains("\\\"v2\\\""));
        assert!(!p.user.contains("rejected"));
    }

    #[test]
    fn prompt_is_deterministic() {
        let m = msgs();
        let a = build_prompt(&one_batch(&m), "focus on limits", None);
        let b = build_prompt(&one_batch(&m), "focus on limits", None);
        assert_eq!(a, b);
        assert!(a.user.contains("Additional guidance:\nfocus on limits"));
    }

    #[test]
    fn repair_prompt_embeds_issues_and_previous_output() {
        let m = msgs();
        let issues = vec!["facts[0].sources: must contain at least one source".to_string()];
        let repair = RepairContext {
            issues: &issues,
            invalid_output: "{\"facts\": [{\"statement\": \"x\", \"sources\": []}]}",
        };
        let p = build_prompt(&one_batch(&m), "", Some(&repair));
        assert!(p.user.contains("- facts[0].sources: must contain at least one source"));
        assert!(p.user.contains("<<<\n{\"facts\": [{\"statement\": \"x\""));
        assert!(p.user.contains("Return only the corrected JSON object"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "Hello 世界";
        let t = truncate_to_char_boundary(text, 8);
        assert!(t.len() <= 8);
        assert!(text.starts_with(t));
        assert_eq!(truncate_to_char_boundary("abc", 10), "abc");
    }
}
