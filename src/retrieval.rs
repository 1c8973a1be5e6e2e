//! Ranked retrieval, link expansion and the keyword fallback.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::knowledge::FactMatch;
use crate::memory::{MemoryId, MemoryRecord, RelationType, SqliteMemoryStore};
use crate::scoring::{compute_composite_score, compute_recency_score_at, RankingStrategy};

/// Default number of results per request.
pub const DEFAULT_LIMIT: usize = 5;

/// Number of top results whose links are expanded.
pub const LINK_EXPANSION_TOP: usize = 3;

/// Query words used by the keyword fallback.
pub const MAX_KEYWORD_TOKENS: usize = 5;

/// Facts below this confidence are not merged into results.
pub const FACT_MIN_CONFIDENCE: f64 = 0.7;

/// Facts at or below this similarity are not merged into results.
pub const FACT_MIN_SIMILARITY: f32 = 0.5;

/// How a memory made it into a result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Semantic,
    Keyword,
}

/// A record reached by following links from a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedMemory {
    pub record: MemoryRecord,
    pub relation: RelationType,
    pub strength: f64,
}

/// A ranked memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    /// Composite score; zero for keyword matches
    pub score: f64,
    pub semantic_similarity: f64,
    pub recency: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_memories: Vec<LinkedMemory>,
    pub source: MatchSource,
}

/// One entry of a merged result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetrievalResult {
    Fact(FactMatch),
    Memory(ScoredMemory),
}

impl RetrievalResult {
    /// Text carried by this result.
    pub fn content(&self) -> &str {
        match self {
            Self::Fact(fact) => &fact.fact,
            Self::Memory(memory) => &memory.record.content,
        }
    }

    pub fn as_memory(&self) -> Option<&ScoredMemory> {
        match self {
            Self::Memory(memory) => Some(memory),
            Self::Fact(_) => None,
        }
    }

    pub fn as_fact(&self) -> Option<&FactMatch> {
        match self {
            Self::Fact(fact) => Some(fact),
            Self::Memory(_) => None,
        }
    }
}

/// Parameters of one retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub strategy: RankingStrategy,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// OR-matched against stored tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Overrides the engine's configured link depth
    #[serde(default)]
    pub link_depth: Option<usize>,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            strategy: RankingStrategy::default(),
            limit: DEFAULT_LIMIT,
            tags: None,
            link_depth: None,
        }
    }

    pub fn with_strategy(mut self, strategy: RankingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the strategy by name; unknown names mean balanced.
    pub fn with_strategy_name(mut self, name: &str) -> Self {
        self.strategy = RankingStrategy::from_name(name);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_link_depth(mut self, depth: usize) -> Self {
        self.link_depth = Some(depth);
        self
    }
}

/// Rank embedded memories against `embedding` and return the top `limit`.
///
/// Every returned record has its access count incremented in storage, and
/// the returned copies reflect that.
pub fn retrieve_memories(
    store: &SqliteMemoryStore,
    embedding: &[f32],
    strategy: RankingStrategy,
    limit: usize,
    tags: Option<&[String]>,
    half_life_days: f64,
) -> Result<Vec<ScoredMemory>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut scored: Vec<ScoredMemory> = store
        .ranking_candidates(tags)?
        .into_iter()
        .filter_map(|record| {
            let similarity = cosine_similarity(embedding, record.embedding.as_deref()?) as f64;
            let recency = compute_recency_score_at(record.created_at, now, half_life_days);
            let score = compute_composite_score(similarity, recency, record.importance, strategy);
            Some(ScoredMemory {
                record,
                score,
                semantic_similarity: similarity,
                recency,
                linked_memories: Vec::new(),
                source: MatchSource::Semantic,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(limit);

    let ids: Vec<MemoryId> = scored.iter().map(|m| m.record.id.clone()).collect();
    store.record_access(&ids)?;
    for memory in &mut scored {
        memory.record.access_count += 1;
        memory.record.updated_at = now;
    }

    debug!(returned = scored.len(), %strategy, "ranked memories");
    Ok(scored)
}

/// Attach linked records to the first `top` results.
pub fn expand_links(
    store: &SqliteMemoryStore,
    results: &mut [ScoredMemory],
    top: usize,
    depth: usize,
) -> Result<()> {
    for memory in results.iter_mut().take(top) {
        memory.linked_memories = follow_links(store, &memory.record.id, depth)?;
    }
    Ok(())
}

/// Breadth-first walk of links from `start`, in both directions, up to
/// `depth` hops. Nodes are visited once; links to deleted records are skipped.
pub fn follow_links(
    store: &SqliteMemoryStore,
    start: &MemoryId,
    depth: usize,
) -> Result<Vec<LinkedMemory>> {
    let mut found = Vec::new();
    let mut visited: HashSet<MemoryId> = HashSet::from([start.clone()]);
    let mut queue: VecDeque<(MemoryId, usize)> = VecDeque::from([(start.clone(), 0)]);

    while let Some((node, hops)) = queue.pop_front() {
        if hops >= depth {
            continue;
        }
        for link in store.links_for(&node)? {
            let Some(other) = link.other(&node) else {
                continue;
            };
            if !visited.insert(other.clone()) {
                continue;
            }
            match store.get_memory(other)? {
                Some(record) => {
                    found.push(LinkedMemory {
                        record,
                        relation: link.relation_type,
                        strength: link.strength,
                    });
                    queue.push_back((other.clone(), hops + 1));
                }
                None => debug!(from = %node, to = %other, "skipping dangling link"),
            }
        }
    }
    Ok(found)
}

/// Split a query into at most [`MAX_KEYWORD_TOKENS`] lowercase words.
pub fn keyword_tokens(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(MAX_KEYWORD_TOKENS)
        .collect()
}

/// Memories whose content contains any query word, newest first.
///
/// Used when the query cannot be embedded. Does not count as an access.
pub fn keyword_search(
    store: &SqliteMemoryStore,
    query: &str,
    limit: usize,
) -> Result<Vec<ScoredMemory>> {
    let tokens = keyword_tokens(query);
    let now = Utc::now();
    let records = store.keyword_search(&tokens, limit)?;
    Ok(records
        .into_iter()
        .map(|record| ScoredMemory {
            recency: compute_recency_score_at(
                record.created_at,
                now,
                crate::scoring::DEFAULT_HALF_LIFE_DAYS,
            ),
            record,
            score: 0.0,
            semantic_similarity: 0.0,
            linked_memories: Vec::new(),
            source: MatchSource::Keyword,
        })
        .collect())
}

/// Put qualifying facts ahead of memories and cut the list to `limit`.
pub fn merge_results(
    facts: Vec<FactMatch>,
    memories: Vec<ScoredMemory>,
    limit: usize,
) -> Vec<RetrievalResult> {
    facts
        .into_iter()
        .filter(|f| f.confidence >= FACT_MIN_CONFIDENCE && f.similarity > FACT_MIN_SIMILARITY)
        .map(RetrievalResult::Fact)
        .chain(memories.into_iter().map(RetrievalResult::Memory))
        .take(limit)
        .collect()
}
