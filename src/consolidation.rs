//! Periodic consolidation of aging short-term memories.
//!
//! Old short-term records are clustered greedily by similarity to a seed.
//! Each multi-member cluster is replaced by one long-term summary record,
//! with a `consolidated_into` link from every former member. In standard
//! retention mode, low-importance short-term records are pruned afterwards.
//!
//! Clusters commit one at a time. A failure leaves earlier clusters merged
//! and later ones untouched for the next run.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ConsolidationConfig, RetentionMode};
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::{MemoryId, MemoryRecord, SqliteMemoryStore, Tier};
use crate::retry::RetryPolicy;

/// Outcome of one consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Clusters replaced by a summary
    pub clusters_merged: usize,
    /// Records removed into summaries
    pub consolidated: usize,
    /// Records removed by low-importance pruning
    pub pruned: usize,
    pub summary_ids: Vec<MemoryId>,
}

impl ConsolidationReport {
    /// Records removed by this run.
    pub fn total(&self) -> usize {
        self.consolidated + self.pruned
    }
}

/// In-process guard against overlapping consolidation runs.
#[derive(Debug, Default)]
pub struct ConsolidationLock {
    running: AtomicBool,
}

impl ConsolidationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or fail with [`Error::ConsolidationInProgress`].
    pub fn try_acquire(&self) -> Result<ConsolidationPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ConsolidationInProgress)?;
        Ok(ConsolidationPermit { lock: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of a run; releases the lock on drop.
#[derive(Debug)]
pub struct ConsolidationPermit<'a> {
    lock: &'a ConsolidationLock,
}

impl Drop for ConsolidationPermit<'_> {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::Release);
    }
}

/// Short-term memories older than `max_age_days`, in insertion order.
pub fn find_old_memories(store: &SqliteMemoryStore, max_age_days: i64) -> Result<Vec<MemoryRecord>> {
    store.short_term_before(Utc::now() - Duration::days(max_age_days))
}

/// Greedy single pass clustering.
///
/// Each unassigned record seeds a cluster and absorbs every later unassigned
/// record whose similarity to the seed is at least `threshold`. Members are
/// never compared with each other. Records without an embedding always
/// form singletons.
pub fn cluster_memories(records: &[MemoryRecord], threshold: f32) -> Vec<Vec<&MemoryRecord>> {
    let mut assigned = vec![false; records.len()];
    let mut clusters = Vec::new();

    for (i, seed) in records.iter().enumerate() {
        if assigned[i] {
            continue;
        }
        assigned[i] = true;
        let mut cluster = vec![seed];

        if let Some(seed_vec) = seed.embedding.as_deref() {
            for (j, candidate) in records.iter().enumerate().skip(i + 1) {
                if assigned[j] {
                    continue;
                }
                let Some(candidate_vec) = candidate.embedding.as_deref() else {
                    continue;
                };
                if cosine_similarity(seed_vec, candidate_vec) >= threshold {
                    assigned[j] = true;
                    cluster.push(candidate);
                }
            }
        }
        clusters.push(cluster);
    }
    clusters
}

/// Build the long-term record that replaces `members`.
///
/// The most important member supplies content, importance and embedding;
/// the first one wins ties. Tags are the union over all members.
pub fn summarize_cluster(members: &[&MemoryRecord]) -> Option<MemoryRecord> {
    let best = members
        .iter()
        .copied()
        .reduce(|best, m| if m.importance > best.importance { m } else { best })?;

    let mut tags: Vec<String> = Vec::new();
    for tag in members.iter().flat_map(|m| m.tags.iter()) {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    let sources: Vec<Value> = members
        .iter()
        .map(|m| Value::from(m.id.as_str()))
        .collect();

    let mut summary = MemoryRecord::new(best.chunk_type, best.content.clone())
        .with_turn(best.turn_id.clone(), best.chunk_index, best.total_chunks)
        .with_tier(Tier::LongTerm)
        .with_importance(best.importance)
        .with_tags(tags)
        .with_source_agent(best.source_agent.clone())
        .with_metadata("consolidated_from", Value::Array(sources));
    summary.embedding = best.embedding.clone();
    Some(summary)
}

/// Delete short-term memories with importance below `threshold`.
pub fn prune_low_importance(store: &SqliteMemoryStore, threshold: f64) -> Result<usize> {
    store.prune_short_term(threshold)
}

/// Run one consolidation pass over the whole store.
pub fn run_consolidation(
    store: &SqliteMemoryStore,
    config: &ConsolidationConfig,
    mode: RetentionMode,
    retry: &RetryPolicy,
) -> Result<ConsolidationReport> {
    let old = find_old_memories(store, config.max_age_days)?;
    let mut report = ConsolidationReport::default();

    for cluster in cluster_memories(&old, config.cluster_threshold) {
        if cluster.len() < 2 {
            continue;
        }
        let Some(summary) = summarize_cluster(&cluster) else {
            continue;
        };
        let members: Vec<MemoryId> = cluster.iter().map(|m| m.id.clone()).collect();
        retry.run_blocking("consolidate_cluster", || {
            store.replace_cluster(&summary, &members)
        })?;

        debug!(summary_id = %summary.id, members = members.len(), "merged cluster");
        report.clusters_merged += 1;
        report.consolidated += members.len();
        report.summary_ids.push(summary.id);
    }

    if mode == RetentionMode::Standard {
        report.pruned = retry.run_blocking("prune_low_importance", || {
            prune_low_importance(store, config.prune_threshold)
        })?;
    }

    info!(
        candidates = old.len(),
        clusters = report.clusters_merged,
        consolidated = report.consolidated,
        pruned = report.pruned,
        %mode,
        "consolidation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::{at_similarity, axis};
    use crate::memory::{ChunkType, RelationType};
    use pretty_assertions::assert_eq;

    fn old_record(content: &str, embedding: Vec<f32>, importance: f64) -> MemoryRecord {
        MemoryRecord::new(ChunkType::AgentResponse, content)
            .with_embedding(embedding)
            .with_importance(importance)
            .with_created_at(Utc::now() - Duration::days(10))
    }

    fn off_axis(sim: f32) -> Vec<f32> {
        let mut v = vec![0.0; axis(0).len()];
        v[0] = sim;
        v[2] = (1.0 - sim * sim).sqrt();
        v
    }

    #[test]
    fn test_similar_pair_is_merged() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let a = old_record("deploy with blue green", axis(0), 0.4).with_tags(["ops"]);
        let b = old_record("blue green deploys", at_similarity(0.95), 0.6).with_tags(["deploy"]);
        let c = old_record("favourite colour", off_axis(0.1), 0.5);
        for r in [&a, &b, &c] {
            store.insert_memory(r).unwrap();
        }

        let report = run_consolidation(
            &store,
            &ConsolidationConfig::default(),
            RetentionMode::Full,
            &RetryPolicy::immediate(1),
        )
        .unwrap();

        assert_eq!(report.clusters_merged, 1);
        assert_eq!(report.consolidated, 2);
        assert_eq!(report.pruned, 0);
        assert_eq!(report.total(), 2);

        assert!(store.get_memory(&a.id).unwrap().is_none());
        assert!(store.get_memory(&b.id).unwrap().is_none());
        assert!(store.get_memory(&c.id).unwrap().is_some());

        let summary = store.get_memory(&report.summary_ids[0]).unwrap().unwrap();
        assert_eq!(summary.tier, Tier::LongTerm);
        assert_eq!(summary.content, b.content);
        assert_eq!(summary.importance, 0.6);
        assert_eq!(summary.tags, vec!["ops".to_string(), "deploy".to_string()]);

        for member in [&a, &b] {
            let links = store.links_for(&member.id).unwrap();
            assert_eq!(links.len(), 1);
            assert_eq!(links[0].relation_type, RelationType::ConsolidatedInto);
            assert_eq!(links[0].memory_id_b, summary.id);
        }
    }

    #[test]
    fn test_recent_memories_untouched() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let fresh_a = MemoryRecord::new(ChunkType::AgentResponse, "a").with_embedding(axis(0));
        let fresh_b = MemoryRecord::new(ChunkType::AgentResponse, "b").with_embedding(axis(0));
        store.insert_memory(&fresh_a).unwrap();
        store.insert_memory(&fresh_b).unwrap();

        let report = run_consolidation(
            &store,
            &ConsolidationConfig::default(),
            RetentionMode::Full,
            &RetryPolicy::immediate(1),
        )
        .unwrap();
        assert_eq!(report, ConsolidationReport::default());
        assert_eq!(store.stats().unwrap().short_term, 2);
    }

    #[test]
    fn test_clustering_compares_only_to_seed() {
        let seed = old_record("seed", axis(0), 0.2);
        let mut left = vec![0.0; axis(0).len()];
        left[0] = 0.75;
        left[1] = (1.0f32 - 0.75 * 0.75).sqrt();
        let mut right = left.clone();
        right[1] = -right[1];
        // left and right are far apart but both close to the seed
        assert!(cosine_similarity(&left, &right) < 0.7);

        let records = vec![
            seed,
            old_record("left", left, 0.2),
            old_record("right", right, 0.2),
        ];
        let clusters = cluster_memories(&records, 0.7);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    #[test]
    fn test_records_without_embedding_stay_single() {
        let mut bare = old_record("bare", axis(0), 0.2);
        bare.embedding = None;
        let records = vec![bare, old_record("a", axis(0), 0.2), old_record("b", axis(0), 0.2)];
        let sizes: Vec<usize> = cluster_memories(&records, 0.7).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn test_summary_prefers_first_on_tie() {
        let a = old_record("first", axis(0), 0.5);
        let b = old_record("second", axis(0), 0.5);
        let summary = summarize_cluster(&[&a, &b]).unwrap();
        assert_eq!(summary.content, "first");
        assert_eq!(
            summary.metadata["consolidated_from"],
            serde_json::json!([a.id.as_str(), b.id.as_str()])
        );
        assert!(summarize_cluster(&[]).is_none());
    }

    #[test]
    fn test_standard_mode_prunes() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let weak = MemoryRecord::new(ChunkType::AgentResponse, "weak").with_importance(0.1);
        let strong = MemoryRecord::new(ChunkType::AgentResponse, "strong").with_importance(0.8);
        let long = MemoryRecord::new(ChunkType::AgentResponse, "kept")
            .with_importance(0.1)
            .with_tier(Tier::LongTerm);
        for r in [&weak, &strong, &long] {
            store.insert_memory(r).unwrap();
        }

        let full = run_consolidation(
            &store,
            &ConsolidationConfig::default(),
            RetentionMode::Full,
            &RetryPolicy::immediate(1),
        )
        .unwrap();
        assert_eq!(full.pruned, 0);

        let standard = run_consolidation(
            &store,
            &ConsolidationConfig::default(),
            RetentionMode::Standard,
            &RetryPolicy::immediate(1),
        )
        .unwrap();
        assert_eq!(standard.pruned, 1);
        assert!(store.get_memory(&weak.id).unwrap().is_none());
        assert!(store.get_memory(&strong.id).unwrap().is_some());
        assert!(store.get_memory(&long.id).unwrap().is_some());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let lock = ConsolidationLock::new();
        let permit = lock.try_acquire().unwrap();
        assert!(lock.is_running());
        assert!(matches!(lock.try_acquire(), Err(Error::ConsolidationInProgress)));
        drop(permit);
        assert!(lock.try_acquire().is_ok());
    }
}
