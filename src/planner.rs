//! Token-budgeted batch planning.
//!
//! Greedy single pass over the ordered message list: messages accumulate in
//! the current batch until the next one would push the estimated cost over
//! the token budget or the count over the per-batch cap. A message that is
//! too large on its own still becomes a singleton batch; nothing is dropped
//! or split.
//!
//! Batches borrow contiguous slices of the input, so planning is lazy and
//! can be recomputed identically from the same list. The coordinator relies
//! on that when it resumes from a checkpoint: it re-plans everything after
//! `last_id` instead of persisting batch boundaries.

use std::collections::HashMap;

use crate::models::Message;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate: one token per four characters, at least one for
/// any non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() / CHARS_PER_TOKEN).max(1)
}

/// Limits applied while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub token_budget: usize,
    pub per_message_overhead: usize,
    pub max_messages: usize,
}

impl BatchLimits {
    /// Estimated cost of one message: its text plus the fixed overhead.
    pub fn message_cost(&self, message: &Message) -> usize {
        self.per_message_overhead + estimate_tokens(&message.text)
    }
}

/// An ordered, non-empty run of consecutive messages.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub index: usize,
    pub messages: &'a [Message],
    pub estimated_tokens: usize,
}

impl<'a> Batch<'a> {
    pub fn first_id(&self) -> i64 {
        self.messages.first().map(|m| m.id).unwrap_or_default()
    }

    pub fn last_id(&self) -> i64 {
        self.messages.last().map(|m| m.id).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// `msg:<id>` → message text, for grounding checks.
    pub fn source_texts(&self) -> HashMap<String, &'a str> {
        self.messages
            .iter()
            .map(|m| (m.source_id(), m.text.as_str()))
            .collect()
    }

    /// Message id → message, for metadata derivation.
    pub fn by_id(&self) -> HashMap<i64, &'a Message> {
        self.messages.iter().map(|m| (m.id, m)).collect()
    }
}

/// Drop messages that are blank after trimming or shorter than `min_text_len`
/// characters. Applied before planning.
pub fn retain_eligible(mut messages: Vec<Message>, min_text_len: Option<usize>) -> Vec<Message> {
    messages.retain(|m| {
        let trimmed = m.text.trim();
        !trimmed.is_empty() && min_text_len.map_or(true, |min| m.text.chars().count() >= min)
    });
    messages
}

/// Plan batches over `messages`. Lazy; call again to restart.
pub fn plan(messages: &[Message], limits: BatchLimits) -> BatchPlan<'_> {
    BatchPlan {
        messages,
        limits,
        pos: 0,
        next_index: 0,
    }
}

/// Iterator returned by [`plan`].
#[derive(Debug, Clone)]
pub struct BatchPlan<'a> {
    messages: &'a [Message],
    limits: BatchLimits,
    pos: usize,
    next_index: usize,
}

impl<'a> Iterator for BatchPlan<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Batch<'a>> {
        if self.pos >= self.messages.len() {
            return None;
        }

        let max_messages = self.limits.max_messages.max(1);
        let start = self.pos;
        let mut tokens = 0usize;

        while self.pos < self.messages.len() {
            let count = self.pos - start;
            let cost = self.limits.message_cost(&self.messages[self.pos]);
            if count > 0 && (tokens + cost > self.limits.token_budget || count + 1 > max_messages)
            {
                break;
            }
            tokens += cost;
            self.pos += 1;
        }

        let batch = Batch {
            index: self.next_index,
            messages: &self.messages[start..self.pos],
            estimated_tokens: tokens,
        };
        self.next_index += 1;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(budget: usize, overhead: usize, max: usize) -> BatchLimits {
        BatchLimits {
            token_budget: budget,
            per_message_overhead: overhead,
            max_messages: max,
        }
    }

    /// Deterministic spread of message lengths without pulling in a RNG crate.
    fn messages(n: usize, seed: u64) -> Vec<Message> {
        let mut state = seed;
        (0..n)
            .map(|i| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let len = 1 + (state >> 33) as usize % 600;
                Message::new(i as i64 + 1, "x".repeat(len))
            })
            .collect()
    }

    #[test]
    fn estimate_tokens_rounds_down_with_floor_of_one() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("привет мир"), 2);
    }

    #[test]
    fn batches_partition_input_in_order() {
        for seed in 1..20u64 {
            let msgs = messages(137, seed);
            for budget in [50usize, 300, 1_000, 5_000] {
                let lim = limits(budget, 10, 25);
                let batches: Vec<Batch> = plan(&msgs, lim).collect();
                let flattened: Vec<i64> = batches
                    .iter()
                    .flat_map(|b| b.messages.iter().map(|m| m.id))
                    .collect();
                let expected: Vec<i64> = msgs.iter().map(|m| m.id).collect();
                assert_eq!(flattened, expected, "seed={} budget={}", seed, budget);

                for b in &batches {
                    assert!(!b.is_empty());
                    assert!(b.len() <= 25);
                    if b.len() > 1 {
                        assert!(b.estimated_tokens <= budget);
                    } else {
                        // Only singletons may exceed the budget.
                        assert_eq!(b.estimated_tokens, lim.message_cost(&b.messages[0]));
                    }
                }
            }
        }
    }

    #[test]
    fn oversized_message_becomes_singleton() {
        let msgs = vec![
            Message::new(1, "short"),
            Message::new(2, "y".repeat(4_000)),
            Message::new(3, "short"),
        ];
        let batches: Vec<Batch> = plan(&msgs, limits(100, 10, 50)).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].first_id(), 2);
        assert_eq!(batches[1].len(), 1);
        assert!(batches[1].estimated_tokens > 100);
    }

    #[test]
    fn message_cap_closes_batches() {
        let msgs: Vec<Message> = (1..=7).map(|i| Message::new(i, "tiny")).collect();
        let sizes: Vec<usize> = plan(&msgs, limits(1_000_000, 0, 3)).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn batch_indices_are_contiguous() {
        let msgs = messages(40, 7);
        for (i, b) in plan(&msgs, limits(200, 5, 10)).enumerate() {
            assert_eq!(b.index, i);
        }
    }

    #[test]
    fn replanning_suffix_reproduces_remaining_batches() {
        let msgs = messages(90, 3);
        let lim = limits(400, 20, 12);
        let full: Vec<Batch> = plan(&msgs, lim).collect();
        let resume_after = full[2].last_id();
        let suffix: Vec<Message> = msgs.iter().filter(|m| m.id > resume_after).cloned().collect();
        let replanned: Vec<Vec<i64>> = plan(&suffix, lim)
            .map(|b| b.messages.iter().map(|m| m.id).collect())
            .collect();
        let remaining: Vec<Vec<i64>> = full[3..]
            .iter()
            .map(|b| b.messages.iter().map(|m| m.id).collect())
            .collect();
        assert_eq!(replanned, remaining);
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert_eq!(plan(&[], limits(10, 1, 1)).count(), 0);
    }

    #[test]
    fn retain_eligible_drops_blank_and_short() {
        let msgs = vec![
            Message::new(1, "   "),
            Message::new(2, "ok"),
            Message::new(3, "long enough text"),
        ];
        let kept: Vec<i64> = retain_eligible(msgs.clone(), None).iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![2, 3]);
        let kept: Vec<i64> = retain_eligible(msgs, Some(5)).iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![3]);
    }
}
