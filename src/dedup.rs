//! Near-duplicate detection against recently stored embeddings.

use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::memory::MemoryId;

/// Similarity above which a candidate is treated as the same memory.
pub const EXACT_DUP_THRESHOLD: f32 = 0.92;

/// Similarity at or above which a candidate is linked as related.
pub const RELATED_THRESHOLD: f32 = 0.70;

/// Strength of the `related_to` link written for a related match.
pub const RELATED_LINK_STRENGTH: f64 = 0.8;

/// Importance added to the matched record on an exact duplicate.
pub const DUPLICATE_BOOST: f64 = 0.1;

/// Outcome class of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Skip storing and boost the match
    ExactDup,
    /// Store and link to the match
    Related,
    /// Store without a link
    Novel,
}

/// Best match found by [`check_duplicate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupResult {
    pub match_type: MatchType,
    pub matched_id: Option<MemoryId>,
    pub similarity: f32,
}

impl DedupResult {
    fn novel(similarity: f32) -> Self {
        Self {
            match_type: MatchType::Novel,
            matched_id: None,
            similarity,
        }
    }
}

/// Classify `embedding` against existing `(id, embedding)` pairs.
///
/// Only the single best match counts. Ties keep the first candidate seen.
/// The caller bounds `existing`; this is a linear scan.
pub fn check_duplicate(embedding: &[f32], existing: &[(MemoryId, Vec<f32>)]) -> DedupResult {
    let mut best: Option<&MemoryId> = None;
    let mut best_sim = 0.0f32;

    for (id, candidate) in existing {
        let sim = cosine_similarity(embedding, candidate);
        if sim > best_sim {
            best_sim = sim;
            best = Some(id);
        }
    }

    let match_type = classify(best_sim);
    match (match_type, best) {
        (MatchType::Novel, _) | (_, None) => DedupResult::novel(best_sim),
        (match_type, Some(id)) => DedupResult {
            match_type,
            matched_id: Some(id.clone()),
            similarity: best_sim,
        },
    }
}

/// Map a similarity onto a match class.
pub fn classify(similarity: f32) -> MatchType {
    if similarity > EXACT_DUP_THRESHOLD {
        MatchType::ExactDup
    } else if similarity >= RELATED_THRESHOLD {
        MatchType::Related
    } else {
        MatchType::Novel
    }
}
