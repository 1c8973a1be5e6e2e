//! Knowledge cache: verified facts looked up by similarity.
//!
//! Facts never come from ingestion. An external verification step decides
//! what is true and hands it here with a confidence.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::{FactId, KnowledgeFact, SqliteMemoryStore};

/// Most recently verified facts considered by a lookup.
pub const FACT_SCAN_LIMIT: usize = 500;

/// A fact returned by [`lookup_facts`] with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactMatch {
    pub id: FactId,
    pub fact: String,
    pub source_agent: String,
    pub verified_by: String,
    pub verified_at: DateTime<Utc>,
    pub confidence: f64,
    pub metadata: HashMap<String, Value>,
    pub similarity: f32,
}

impl FactMatch {
    fn from_fact(fact: KnowledgeFact, similarity: f32) -> Self {
        Self {
            id: fact.id,
            fact: fact.fact,
            source_agent: fact.source_agent,
            verified_by: fact.verified_by,
            verified_at: fact.verified_at,
            confidence: fact.confidence,
            metadata: fact.metadata,
            similarity,
        }
    }
}

/// Persist a verified fact and return its id.
pub fn store_fact(store: &SqliteMemoryStore, fact: &KnowledgeFact) -> Result<FactId> {
    store.insert_fact(fact)?;
    debug!(fact_id = %fact.id, confidence = fact.confidence, "stored knowledge fact");
    Ok(fact.id.clone())
}

/// Rank the `scan_limit` most recently verified facts against `embedding`.
///
/// `min_confidence` filters after ranking, so fewer than `limit` facts may
/// come back.
pub fn lookup_facts(
    store: &SqliteMemoryStore,
    embedding: &[f32],
    limit: usize,
    min_confidence: Option<f64>,
    scan_limit: usize,
) -> Result<Vec<FactMatch>> {
    let mut scored: Vec<FactMatch> = store
        .recent_facts(scan_limit)?
        .into_iter()
        .filter_map(|fact| {
            let sim = cosine_similarity(embedding, fact.embedding.as_deref()?);
            Some(FactMatch::from_fact(fact, sim))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
    scored.truncate(limit);

    if let Some(min) = min_confidence {
        scored.retain(|m| m.confidence >= min);
    }
    Ok(scored)
}

/// Overwrite a fact's confidence, clamped to `[0, 1]`.
pub fn update_confidence(store: &SqliteMemoryStore, id: &FactId, confidence: f64) -> Result<()> {
    if store.update_fact_confidence(id, confidence.clamp(0.0, 1.0))? {
        Ok(())
    } else {
        Err(Error::not_found("fact", id.as_str()))
    }
}
