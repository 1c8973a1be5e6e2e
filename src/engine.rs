//! The memory engine: the single entry point used by orchestration code.
//!
//! `ingest` and `retrieve` never fail. Internal errors are logged and turned
//! into a failed [`IngestResult`] or an empty result list. The remaining
//! operations are off the conversational path and return errors to their
//! caller.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::budget::{self, TokenCost};
use crate::chunker::{chunk_turn, Turn};
use crate::config::{EngineConfig, RetentionMode};
use crate::consolidation::{run_consolidation, ConsolidationLock, ConsolidationReport};
use crate::dedup::{check_duplicate, MatchType, DUPLICATE_BOOST, RELATED_LINK_STRENGTH};
use crate::embedding::{embedder_from_config, Embedder};
use crate::error::{Error, Result};
use crate::knowledge::{self, FactMatch};
use crate::memory::{
    ChunkType, FactId, KnowledgeFact, MemoryId, MemoryLink, MemoryRecord, MemoryStats,
    RelationType, SqliteMemoryStore, StoreBacking,
};
use crate::parallel::{ParallelExecutor, ParallelResults};
use crate::retrieval::{
    expand_links, keyword_search, merge_results, retrieve_memories, RetrievalResult,
    RetrieveRequest,
};
use crate::scoring::compute_importance_score;

/// Importance added by positive feedback.
pub const POSITIVE_FEEDBACK_DELTA: f64 = 0.1;

/// Importance removed by negative feedback.
pub const NEGATIVE_FEEDBACK_DELTA: f64 = -0.3;

/// Strength of links from a user chunk to its responses.
pub const QUERY_RESPONSE_LINK_STRENGTH: f64 = 1.0;

/// Strength of links between response chunks of one turn.
pub const SIBLING_LINK_STRENGTH: f64 = 0.9;

/// Outcome of [`MemoryEngine::ingest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub success: bool,
    /// Records written for this turn
    pub stored_ids: Vec<MemoryId>,
    /// Existing records boosted instead of storing a duplicate
    pub deduplicated: Vec<MemoryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Conversational memory over a single SQLite database.
pub struct MemoryEngine {
    store: SqliteMemoryStore,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
    backing: StoreBacking,
    executor: ParallelExecutor,
    consolidation_lock: ConsolidationLock,
}

impl MemoryEngine {
    /// Open the configured database, recreating or replacing it with an
    /// in-memory store when it cannot be used.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let embedder = embedder_from_config(&config.embedder);
        let (store, backing) = SqliteMemoryStore::open_with_fallback(
            &config.db_path,
            config.busy_timeout(),
            &config.retry,
        )?;
        if backing == StoreBacking::InMemory {
            warn!(path = %config.db_path.display(), "memory is volatile for this process");
        }
        info!(
            path = %config.db_path.display(),
            embedder = embedder.name(),
            ?backing,
            "memory engine ready"
        );
        Ok(Self {
            store,
            embedder,
            config,
            backing,
            executor: ParallelExecutor::new(),
            consolidation_lock: ConsolidationLock::new(),
        })
    }

    /// Assemble an engine from an existing store and embedder.
    pub fn with_parts(
        store: SqliteMemoryStore,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            backing: StoreBacking::File,
            executor: ParallelExecutor::new(),
            consolidation_lock: ConsolidationLock::new(),
        }
    }

    /// Executor used by [`MemoryEngine::retrieve_many`].
    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn store(&self) -> &SqliteMemoryStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backing(&self) -> StoreBacking {
        self.backing
    }

    /// Whether stored memories will be lost when the process exits.
    pub fn is_volatile(&self) -> bool {
        self.backing == StoreBacking::InMemory
    }

    /// Retention mode used by [`MemoryEngine::consolidate_configured`].
    pub fn retention_mode(&self) -> RetentionMode {
        self.config.retention_mode
    }

    // ==================== Ingestion ====================

    /// Chunk, deduplicate and store one conversation turn.
    ///
    /// On failure the result still lists the chunks written before the
    /// error, and those chunks keep their structural links.
    #[instrument(skip(self, turn), fields(agent = %turn.agent))]
    pub async fn ingest(&self, turn: &Turn) -> IngestResult {
        let mut result = IngestResult::default();
        let mut stored: Vec<(MemoryId, ChunkType)> = Vec::new();

        let outcome = self.store_chunks(turn, &mut result, &mut stored).await;
        let linked = self.link_turn(&stored).await;

        match outcome.and(linked) {
            Ok(()) => {
                result.success = true;
                info!(
                    stored = result.stored_ids.len(),
                    deduplicated = result.deduplicated.len(),
                    "ingested turn"
                );
            }
            Err(e) => {
                error!(error = %e, stored = result.stored_ids.len(), "ingest failed");
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn store_chunks(
        &self,
        turn: &Turn,
        result: &mut IngestResult,
        stored: &mut Vec<(MemoryId, ChunkType)>,
    ) -> Result<()> {
        let chunks = chunk_turn(turn);
        let importance = compute_importance_score(&turn.signals);
        let mut existing = self.store.recent_embeddings(self.config.dedup_scan_limit)?;

        for chunk in chunks {
            let embedding = match self.embed(&chunk.content).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "embedding failed, storing text only");
                    None
                }
            };

            let mut related_to = None;
            if let Some(vector) = embedding.as_deref() {
                let dedup = check_duplicate(vector, &existing);
                match (dedup.match_type, dedup.matched_id) {
                    (MatchType::ExactDup, Some(matched)) => {
                        self.config
                            .retry
                            .run("boost_importance", || async {
                                self.store.boost_importance(&matched, DUPLICATE_BOOST)
                            })
                            .await?;
                        debug!(%matched, similarity = dedup.similarity, "duplicate chunk boosted");
                        result.deduplicated.push(matched);
                        continue;
                    }
                    (MatchType::Related, Some(matched)) => related_to = Some(matched),
                    _ => {}
                }
            }

            let metadata = match &chunk.metadata {
                Some(meta) => meta.to_map()?,
                None => HashMap::new(),
            };
            let mut record = MemoryRecord::new(chunk.chunk_type, chunk.content)
                .with_id(chunk.id)
                .with_turn(chunk.turn_id, chunk.chunk_index, chunk.total_chunks)
                .with_importance(importance)
                .with_tags(turn.tags.iter().cloned())
                .with_source_agent(turn.agent.clone());
            record.metadata = metadata;
            record.embedding = embedding;

            self.config
                .retry
                .run("insert_memory", || async { self.store.insert_memory(&record) })
                .await?;
            stored.push((record.id.clone(), record.chunk_type));
            result.stored_ids.push(record.id.clone());

            if let Some(matched) = related_to {
                let link = MemoryLink::new(
                    record.id.clone(),
                    matched,
                    RelationType::RelatedTo,
                    RELATED_LINK_STRENGTH,
                );
                self.insert_link(&link).await?;
            }

            if let Some(vector) = record.embedding.take() {
                existing.push((record.id, vector));
            }
        }
        Ok(())
    }

    /// Link the stored chunks of one turn: query to each response, and
    /// responses to each other.
    async fn link_turn(&self, stored: &[(MemoryId, ChunkType)]) -> Result<()> {
        let query = stored
            .iter()
            .find(|(_, kind)| *kind == ChunkType::UserQuery)
            .map(|(id, _)| id);
        let responses: Vec<&MemoryId> = stored
            .iter()
            .filter(|(_, kind)| *kind == ChunkType::AgentResponse)
            .map(|(id, _)| id)
            .collect();

        if let Some(query) = query {
            for response in &responses {
                let link = MemoryLink::new(
                    query.clone(),
                    (*response).clone(),
                    RelationType::QueryResponse,
                    QUERY_RESPONSE_LINK_STRENGTH,
                );
                self.insert_link(&link).await?;
            }
        }
        for (i, a) in responses.iter().enumerate() {
            for b in &responses[i + 1..] {
                let link = MemoryLink::new(
                    (*a).clone(),
                    (*b).clone(),
                    RelationType::Sibling,
                    SIBLING_LINK_STRENGTH,
                );
                self.insert_link(&link).await?;
            }
        }
        Ok(())
    }

    async fn insert_link(&self, link: &MemoryLink) -> Result<bool> {
        self.config
            .retry
            .run("insert_link", || async { self.store.insert_link(link) })
            .await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self.config.embed_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.embedder.embed(text))
                .await
                .unwrap_or_else(|_| Err(Error::timeout(limit.as_millis() as u64))),
            None => self.embedder.embed(text).await,
        }
    }

    // ==================== Retrieval ====================

    /// Ranked memories and facts for a query.
    ///
    /// Falls back to keyword search when the query cannot be embedded, and
    /// to an empty list when that fails too.
    #[instrument(skip(self, request), fields(strategy = %request.strategy, limit = request.limit))]
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Vec<RetrievalResult> {
        match self.embed(&request.query).await {
            Ok(embedding) => match self.semantic_retrieve(request, &embedding) {
                Ok(results) => return results,
                Err(e) => warn!(error = %e, "ranked retrieval failed, using keyword search"),
            },
            Err(e) => warn!(error = %e, "query embedding failed, using keyword search"),
        }

        match keyword_search(&self.store, &request.query, request.limit) {
            Ok(memories) => memories.into_iter().map(RetrievalResult::Memory).collect(),
            Err(e) => {
                error!(error = %e, "keyword fallback failed");
                Vec::new()
            }
        }
    }

    fn semantic_retrieve(
        &self,
        request: &RetrieveRequest,
        embedding: &[f32],
    ) -> Result<Vec<RetrievalResult>> {
        let mut memories = retrieve_memories(
            &self.store,
            embedding,
            request.strategy,
            request.limit,
            request.tags.as_deref(),
            self.config.half_life_days,
        )?;
        expand_links(
            &self.store,
            &mut memories,
            self.config.link_expansion_top,
            request.link_depth.unwrap_or(self.config.link_depth),
        )?;

        let facts = knowledge::lookup_facts(
            &self.store,
            embedding,
            self.config.fact_merge_limit,
            None,
            self.config.fact_scan_limit,
        )
        .unwrap_or_else(|e| {
            warn!(error = %e, "fact lookup failed, returning memories only");
            Vec::new()
        });

        Ok(merge_results(facts, memories, request.limit))
    }

    /// Run several retrievals concurrently. Results keep request order.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn retrieve_many(
        &self,
        requests: Vec<RetrieveRequest>,
    ) -> ParallelResults<Vec<RetrievalResult>> {
        self.executor
            .execute(requests, |request| async move { Ok(self.retrieve(&request).await) })
            .await
    }

    // ==================== Feedback ====================

    /// Raise or lower a memory's importance. Unknown ids are ignored.
    #[instrument(skip(self))]
    pub async fn feedback(&self, memory_id: &MemoryId, positive: bool) -> Result<()> {
        let delta = if positive {
            POSITIVE_FEEDBACK_DELTA
        } else {
            NEGATIVE_FEEDBACK_DELTA
        };
        let found = self
            .config
            .retry
            .run("adjust_importance", || async {
                self.store.adjust_importance(memory_id, delta)
            })
            .await?;
        if !found {
            debug!(%memory_id, "feedback for unknown memory");
        }
        Ok(())
    }

    // ==================== Knowledge ====================

    /// Store a verified fact.
    #[instrument(skip(self, fact, metadata))]
    pub async fn store_fact(
        &self,
        fact: &str,
        source_agent: &str,
        confidence: f64,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<FactId> {
        let embedding = self.embed(fact).await?;
        let record = KnowledgeFact::new(fact, source_agent, confidence)
            .with_embedding(embedding)
            .with_metadata_map(metadata.unwrap_or_default());
        self.config
            .retry
            .run("store_fact", || async {
                knowledge::store_fact(&self.store, &record)
            })
            .await
    }

    /// Facts most similar to `query`.
    #[instrument(skip(self, query))]
    pub async fn lookup_facts(
        &self,
        query: &str,
        limit: usize,
        min_confidence: Option<f64>,
    ) -> Result<Vec<FactMatch>> {
        let embedding = self.embed(query).await?;
        knowledge::lookup_facts(
            &self.store,
            &embedding,
            limit,
            min_confidence,
            self.config.fact_scan_limit,
        )
    }

    #[instrument(skip(self))]
    pub async fn update_fact_confidence(&self, fact_id: &FactId, confidence: f64) -> Result<()> {
        self.config
            .retry
            .run("update_fact_confidence", || async {
                knowledge::update_confidence(&self.store, fact_id, confidence)
            })
            .await
    }

    // ==================== Budget ====================

    /// Tokens available for injected memory.
    pub fn get_context_budget(&self, total_tokens: usize, conversation_tokens: usize) -> usize {
        budget::get_context_budget(total_tokens, conversation_tokens)
    }

    /// Trim ranked results to fit `token_budget` tokens.
    pub fn apply_context_budget<T: TokenCost>(&self, items: Vec<T>, token_budget: usize) -> Vec<T> {
        budget::apply_context_budget(items, token_budget)
    }

    // ==================== Maintenance ====================

    /// Run one consolidation pass and return the number of records removed.
    ///
    /// Blocks while retrying a busy database. Async callers should run it on
    /// a blocking thread.
    #[instrument(skip(self))]
    pub fn consolidate(&self, mode: RetentionMode) -> Result<usize> {
        self.consolidate_with_report(mode).map(|report| report.total())
    }

    /// Run one consolidation pass in the configured retention mode.
    pub fn consolidate_configured(&self) -> Result<usize> {
        self.consolidate(self.config.retention_mode)
    }

    /// Run one consolidation pass and return its full report.
    pub fn consolidate_with_report(&self, mode: RetentionMode) -> Result<ConsolidationReport> {
        let _permit = self.consolidation_lock.try_acquire()?;
        run_consolidation(
            &self.store,
            &self.config.consolidation,
            mode,
            &self.config.retry,
        )
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        self.store.stats()
    }

    pub fn get_memory(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.store.get_memory(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetadata;
    use crate::embedding::testing::{at_similarity, axis, FailingEmbedder, FixedEmbedder, StalledEmbedder};
    use crate::embedding::HashingEmbedder;
    use crate::retrieval::MatchSource;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    fn hashing_engine() -> MemoryEngine {
        engine_with(Arc::new(HashingEmbedder::default()), EngineConfig::default())
    }

    /// An engine over an on-disk store that gives up on locks immediately.
    fn file_engine(path: &std::path::Path, retry: RetryPolicy) -> MemoryEngine {
        let store = SqliteMemoryStore::open_with_timeout(path, Duration::ZERO).unwrap();
        MemoryEngine::with_parts(
            store,
            Arc::new(HashingEmbedder::default()),
            EngineConfig::default().with_retry(retry),
        )
    }

    fn engine_with(embedder: Arc<dyn Embedder>, config: EngineConfig) -> MemoryEngine {
        let config = config.with_retry(RetryPolicy::immediate(1));
        MemoryEngine::with_parts(SqliteMemoryStore::in_memory().unwrap(), embedder, config)
    }

    /// A paragraph of `n` distinct words sharing a prefix.
    fn paragraph(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn split_turn_fixture() -> Turn {
        let response = format!(
            "{}\n\n{}\n\n{}",
            paragraph("alpha", 80),
            paragraph("beta", 80),
            paragraph("gamma", 80)
        );
        Turn::new("how should the cluster be deployed", response)
            .with_agent("ops")
            .with_tags(["deploy"])
    }

    fn metadata(record: &MemoryRecord) -> ChunkMetadata {
        ChunkMetadata::from_map(&record.metadata).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_stores_and_links_turn() {
        let engine = hashing_engine();
        let result = engine.ingest(&split_turn_fixture()).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stored_ids.len(), 4);
        assert!(result.deduplicated.is_empty());

        let records: Vec<MemoryRecord> = result
            .stored_ids
            .iter()
            .map(|id| engine.get_memory(id).unwrap().unwrap())
            .collect();
        let user = &records[0];
        assert_eq!(user.chunk_type, ChunkType::UserQuery);
        assert_eq!(user.source_agent, "ops");
        assert!(records.iter().all(|r| r.turn_id == user.turn_id));
        assert!(records.iter().all(|r| r.has_embedding()));

        let response_ids = result.stored_ids[1..].to_vec();
        assert_eq!(metadata(user).links.response_ids, response_ids);
        for record in &records[1..] {
            let meta = metadata(record);
            assert_eq!(meta.links.query_id.as_ref(), Some(&user.id));
            assert_eq!(meta.links.siblings.len(), 2);
            assert_eq!(record.total_chunks, 3);
            assert_eq!(record.tags, vec!["deploy".to_string()]);
        }

        let user_links = engine.store().links_for(&user.id).unwrap();
        assert_eq!(user_links.len(), 3);
        assert!(user_links
            .iter()
            .all(|l| l.relation_type == RelationType::QueryResponse));
        // three responses pair up into three sibling links
        assert_eq!(engine.stats().unwrap().total_links, 6);
    }

    #[tokio::test]
    async fn test_reingest_boosts_instead_of_storing() {
        let engine = hashing_engine();
        let turn = split_turn_fixture();
        let first = engine.ingest(&turn).await;
        let second = engine.ingest(&turn).await;

        assert!(second.success);
        assert!(second.stored_ids.is_empty());
        assert_eq!(second.deduplicated.len(), 4);
        assert_eq!(engine.stats().unwrap().total_memories, 4);

        let boosted = engine.get_memory(&first.stored_ids[0]).unwrap().unwrap();
        assert!((boosted.importance - 0.3).abs() < 1e-9);
        assert_eq!(boosted.access_count, 1);
    }

    #[tokio::test]
    async fn test_signals_set_importance() {
        let engine = hashing_engine();
        let turn = Turn::new("use tabs not spaces", "noted").with_signals(["user_preference"]);
        let result = engine.ingest(&turn).await;
        let record = engine.get_memory(&result.stored_ids[0]).unwrap().unwrap();
        assert_eq!(record.importance, 0.85);
    }

    #[tokio::test]
    async fn test_related_chunk_is_linked() {
        let embedder = FixedEmbedder::new()
            .with("cache entries expire hourly", axis(0))
            .with("cache entries now expire every two hours", at_similarity(0.8));
        let engine = engine_with(Arc::new(embedder), EngineConfig::default());

        let first = engine
            .ingest(&Turn::new("cache ttl", "cache entries expire hourly"))
            .await;
        let second = engine
            .ingest(&Turn::new("new cache ttl", "cache entries now expire every two hours"))
            .await;
        assert_eq!(second.stored_ids.len(), 2);

        let links = engine.store().links_for(&second.stored_ids[1]).unwrap();
        let related: Vec<&MemoryLink> = links
            .iter()
            .filter(|l| l.relation_type == RelationType::RelatedTo)
            .collect();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].memory_id_b, first.stored_ids[1]);
        assert_eq!(related[0].strength, RELATED_LINK_STRENGTH);
    }

    #[tokio::test]
    async fn test_feedback_adjusts_and_clamps() {
        let engine = hashing_engine();
        let mid = MemoryRecord::new(ChunkType::AgentResponse, "mid").with_importance(0.5);
        let low = MemoryRecord::new(ChunkType::AgentResponse, "low").with_importance(0.2);
        engine.store().insert_memory(&mid).unwrap();
        engine.store().insert_memory(&low).unwrap();

        engine.feedback(&mid.id, true).await.unwrap();
        engine.feedback(&low.id, false).await.unwrap();
        engine
            .feedback(&MemoryId::from("mem_missing"), true)
            .await
            .unwrap();

        let mid = engine.get_memory(&mid.id).unwrap().unwrap();
        let low = engine.get_memory(&low.id).unwrap().unwrap();
        assert!((mid.importance - 0.6).abs() < 1e-9);
        assert_eq!(low.importance, 0.0);
    }

    #[tokio::test]
    async fn test_retrieve_ranks_and_expands_links() {
        let engine = hashing_engine();
        let turn = Turn::new(
            "where are the staging credentials kept",
            "the vault holds them under the ops path",
        );
        let ingested = engine.ingest(&turn).await;
        engine
            .ingest(&Turn::new("what is for lunch", "pizza on friday"))
            .await;

        let results = engine
            .retrieve(&RetrieveRequest::new("where are the staging credentials kept").with_limit(2))
            .await;
        let top = results[0].as_memory().unwrap();
        assert_eq!(top.record.id, ingested.stored_ids[0]);
        assert_eq!(top.source, MatchSource::Semantic);
        assert_eq!(top.linked_memories.len(), 1);
        assert_eq!(top.linked_memories[0].record.id, ingested.stored_ids[1]);
        assert_eq!(top.linked_memories[0].relation, RelationType::QueryResponse);
    }

    #[tokio::test]
    async fn test_facts_merged_ahead_of_memories() {
        let engine = hashing_engine();
        engine
            .ingest(&Turn::new("which region hosts staging", "staging runs in eu-west-1"))
            .await;
        let fact_id = engine
            .store_fact("staging runs in eu-west-1", "verifier", 0.9, None)
            .await
            .unwrap();

        let results = engine
            .retrieve(&RetrieveRequest::new("staging runs in eu-west-1"))
            .await;
        assert_eq!(results[0].as_fact().map(|f| &f.id), Some(&fact_id));
        assert!(results[1..].iter().all(|r| r.as_memory().is_some()));

        engine.update_fact_confidence(&fact_id, 0.4).await.unwrap();
        let results = engine
            .retrieve(&RetrieveRequest::new("staging runs in eu-west-1"))
            .await;
        assert!(results.iter().all(|r| r.as_fact().is_none()));

        let facts = engine
            .lookup_facts("staging runs in eu-west-1", 5, None)
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert!(engine
            .lookup_facts("staging runs in eu-west-1", 5, Some(0.5))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failing_embedder_uses_keyword_fallback() {
        let embedder = Arc::new(FailingEmbedder::default());
        let engine = engine_with(embedder.clone(), EngineConfig::default());

        let result = engine
            .ingest(&Turn::new("how often do we rotate keys", "rotate signing keys weekly"))
            .await;
        assert!(result.success);
        assert_eq!(result.stored_ids.len(), 2);
        assert_eq!(engine.stats().unwrap().without_embedding, 2);

        let results = engine.retrieve(&RetrieveRequest::new("signing")).await;
        assert_eq!(results.len(), 1);
        let memory = results[0].as_memory().unwrap();
        assert_eq!(memory.source, MatchSource::Keyword);
        assert_eq!(memory.record.content, "rotate signing keys weekly");
        assert!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst) >= 3);

        assert!(engine
            .store_fact("keys rotate weekly", "verifier", 0.9, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_retrieve_returns_empty_when_everything_fails() {
        let engine = engine_with(Arc::new(FailingEmbedder::default()), EngineConfig::default());
        engine.store().execute_raw("DROP TABLE memories").unwrap();

        assert!(engine.retrieve(&RetrieveRequest::new("anything")).await.is_empty());

        let result = engine.ingest(&Turn::new("q", "a")).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedding_timeout_degrades() {
        let config = EngineConfig::default().with_embed_timeout(Duration::from_millis(50));
        let engine = engine_with(Arc::new(StalledEmbedder), config);

        let result = engine
            .ingest(&Turn::new("rollback plan", "rollback uses the previous image tag"))
            .await;
        assert!(result.success);
        assert_eq!(engine.stats().unwrap().without_embedding, 2);

        let results = engine.retrieve(&RetrieveRequest::new("rollback")).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.as_memory().is_some_and(|m| m.source == MatchSource::Keyword)));
    }

    #[tokio::test]
    async fn test_retrieve_many_keeps_order() {
        let engine = hashing_engine();
        engine
            .ingest(&Turn::new("database backups", "backups run nightly at two"))
            .await;
        engine
            .ingest(&Turn::new("frontend framework", "the frontend uses svelte"))
            .await;

        let results = engine
            .retrieve_many(vec![
                RetrieveRequest::new("the frontend uses svelte").with_limit(1),
                RetrieveRequest::new("backups run nightly at two").with_limit(1),
            ])
            .await;

        assert!(results.all_succeeded());
        let firsts: Vec<String> = results
            .into_values()
            .into_iter()
            .map(|r| r.unwrap()[0].content().to_string())
            .collect();
        assert_eq!(
            firsts,
            vec!["the frontend uses svelte", "backups run nightly at two"]
        );
    }

    #[tokio::test]
    async fn test_consolidation_guard() {
        let engine = hashing_engine();
        let permit = engine.consolidation_lock.try_acquire().unwrap();
        assert!(matches!(
            engine.consolidate(RetentionMode::Full),
            Err(Error::ConsolidationInProgress)
        ));
        drop(permit);
        assert_eq!(engine.consolidate(RetentionMode::Full).unwrap(), 0);
    }

    #[test]
    fn test_open_reports_backing() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(dir.path().join("nested").join("memory.db"));
        let engine = MemoryEngine::open(config).unwrap();
        assert_eq!(engine.backing(), StoreBacking::File);
        assert!(!engine.is_volatile());
        assert_eq!(engine.stats().unwrap(), MemoryStats::default());
    }

    #[test]
    fn test_budget_passthrough() {
        let engine = hashing_engine();
        assert_eq!(engine.get_context_budget(100_000, 30_000), 15_000);
        let kept = engine.apply_context_budget(vec!["one two three".to_string()], 3);
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn test_partial_ingest_reports_and_links_stored_chunks() {
        let engine = hashing_engine();
        engine
            .store()
            .execute_raw(
                "CREATE TRIGGER reject_gamma BEFORE INSERT ON memories
                 WHEN NEW.content LIKE 'gamma%'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END",
            )
            .unwrap();

        let result = engine.ingest(&split_turn_fixture()).await;

        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("rejected")));
        assert_eq!(result.stored_ids.len(), 3);
        assert_eq!(engine.stats().unwrap().total_memories, 3);
        // user to alpha and beta, plus the alpha-beta sibling link
        assert_eq!(engine.stats().unwrap().total_links, 3);
        let user_links = engine.store().links_for(&result.stored_ids[0]).unwrap();
        assert_eq!(user_links.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_against_locked_database_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let engine = file_engine(&path, RetryPolicy::immediate(3));

        let writer = rusqlite::Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let turn = Turn::new("who owns billing", "the payments team owns billing");
        let blocked = engine.ingest(&turn).await;
        assert!(!blocked.success);
        assert!(blocked.stored_ids.is_empty());
        assert!(
            blocked.error.as_deref().is_some_and(|e| e.contains("busy")),
            "{:?}",
            blocked.error
        );

        writer.execute_batch("COMMIT").unwrap();
        let integrity: String = writer
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .unwrap();
        assert_eq!(integrity, "ok");

        let retried = engine.ingest(&turn).await;
        assert!(retried.success, "{:?}", retried.error);
        assert_eq!(retried.stored_ids.len(), 2);
        assert_eq!(engine.stats().unwrap().total_memories, 2);
    }

    #[tokio::test]
    async fn test_ingest_retries_until_writer_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let engine = file_engine(&path, RetryPolicy::new(3, Duration::from_millis(200)));

        let writer = rusqlite::Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            writer.execute_batch("COMMIT").unwrap();
        });

        let result = engine
            .ingest(&Turn::new("who owns billing", "the payments team owns billing"))
            .await;
        holder.join().unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stored_ids.len(), 2);
        assert_eq!(engine.stats().unwrap().total_links, 1);
    }

    #[test]
    fn test_consolidate_configured_uses_retention_mode() {
        let low = MemoryRecord::new(ChunkType::AgentResponse, "ok thanks").with_importance(0.1);

        let full = hashing_engine();
        full.store().insert_memory(&low).unwrap();
        assert_eq!(full.consolidate_configured().unwrap(), 0);

        let standard = engine_with(
            Arc::new(HashingEmbedder::default()),
            EngineConfig::default().with_retention_mode(RetentionMode::Standard),
        );
        standard.store().insert_memory(&low).unwrap();
        assert_eq!(standard.retention_mode(), RetentionMode::Standard);
        assert_eq!(standard.consolidate_configured().unwrap(), 1);
        assert!(standard.get_memory(&low.id).unwrap().is_none());
    }
}
