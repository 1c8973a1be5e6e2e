//! Token budgeting for memory injected into a model context.

use crate::knowledge::FactMatch;
use crate::memory::MemoryRecord;
use crate::retrieval::{RetrievalResult, ScoredMemory};

/// Share of the context reserved for the system prompt.
pub const SYSTEM_OVERHEAD_RATIO: f64 = 0.10;

/// Share of the context reserved for the model's reply.
pub const RESPONSE_BUFFER_RATIO: f64 = 0.10;

/// Upper bound on the share of the context given to memory.
pub const MAX_MEMORY_RATIO: f64 = 0.15;

/// Words per token used for estimates.
pub const WORDS_PER_TOKEN: f64 = 0.75;

/// Tokens available for injected memory.
///
/// Never negative: an over-full conversation yields zero.
pub fn get_context_budget(total_tokens: usize, conversation_tokens: usize) -> usize {
    let system = (total_tokens as f64 * SYSTEM_OVERHEAD_RATIO) as usize;
    let buffer = (total_tokens as f64 * RESPONSE_BUFFER_RATIO) as usize;
    let remaining = total_tokens
        .saturating_sub(system)
        .saturating_sub(conversation_tokens)
        .saturating_sub(buffer);
    let cap = (total_tokens as f64 * MAX_MEMORY_RATIO) as usize;
    remaining.min(cap)
}

/// Rough token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    (text.split_whitespace().count() as f64 / WORDS_PER_TOKEN) as usize
}

/// Anything that occupies context when injected.
pub trait TokenCost {
    /// Text that would be injected.
    fn token_text(&self) -> &str;

    fn estimated_tokens(&self) -> usize {
        estimate_tokens(self.token_text())
    }
}

impl TokenCost for MemoryRecord {
    fn token_text(&self) -> &str {
        &self.content
    }
}

impl TokenCost for ScoredMemory {
    fn token_text(&self) -> &str {
        &self.record.content
    }
}

impl TokenCost for FactMatch {
    fn token_text(&self) -> &str {
        &self.fact
    }
}

impl TokenCost for RetrievalResult {
    fn token_text(&self) -> &str {
        self.content()
    }
}

impl TokenCost for String {
    fn token_text(&self) -> &str {
        self
    }
}

/// Keep ranked items in order until the next one would overflow `budget`.
///
/// Stops at the first item that does not fit; smaller items after it are
/// not considered.
pub fn apply_context_budget<T: TokenCost>(items: Vec<T>, budget: usize) -> Vec<T> {
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let cost = item.estimated_tokens();
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(item);
    }
    kept
}
