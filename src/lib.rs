//! # cortex-memory
//!
//! Conversational memory for multi-agent systems: turns go in, ranked
//! memories and verified facts come out.
//!
//! ## Core Components
//!
//! - **Chunker**: splits a turn into a user chunk and topic-sized response chunks
//! - **Dedup**: skips near-duplicates and links related memories
//! - **Retrieval**: composite ranking, link expansion and keyword fallback
//! - **Knowledge**: verified facts with confidence
//! - **Consolidation**: merges aging short-term memories into long-term summaries
//! - **Engine**: [`MemoryEngine`], the entry point tying these together
//!
//! ## Example
//!
//! ```rust,ignore
//! use cortex_memory::{EngineConfig, MemoryEngine, RetrieveRequest, Turn};
//!
//! let engine = MemoryEngine::open(EngineConfig::from_env()?)?;
//!
//! let turn = Turn::new("How do we deploy?", "Blue-green via the deploy script.")
//!     .with_agent("ops")
//!     .with_signals(["decision"]);
//! engine.ingest(&turn).await;
//!
//! let results = engine
//!     .retrieve(&RetrieveRequest::new("deployment process").with_limit(3))
//!     .await;
//! let budget = engine.get_context_budget(128_000, 40_000);
//! let context = engine.apply_context_budget(results, budget);
//! ```

pub mod budget;
pub mod chunker;
pub mod config;
pub mod consolidation;
pub mod dedup;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod knowledge;
pub mod memory;
pub mod parallel;
pub mod retrieval;
pub mod retry;
pub mod scoring;

#[cfg(test)]
mod proptest;

// Re-exports for convenience
pub use budget::{apply_context_budget, estimate_tokens, get_context_budget, TokenCost};
pub use chunker::{Chunk, ChunkLinks, ChunkMetadata, Turn};
pub use config::{ConsolidationConfig, EmbedderConfig, EmbedderKind, EngineConfig, RetentionMode};
pub use consolidation::ConsolidationReport;
pub use dedup::{check_duplicate, DedupResult, MatchType};
pub use embedding::{cosine_similarity, ApiEmbedder, Embedder, HashingEmbedder, LocalEmbedder};
pub use engine::{IngestResult, MemoryEngine};
pub use error::{Error, Result};
pub use knowledge::FactMatch;
pub use memory::{
    ChunkType, FactId, KnowledgeFact, MemoryId, MemoryLink, MemoryRecord, MemoryStats,
    RelationType, SqliteMemoryStore, StoreBacking, Tier, TurnId, DEFAULT_BUSY_TIMEOUT,
};
pub use parallel::{ParallelExecutor, ParallelResults, SubResult};
pub use retrieval::{LinkedMemory, MatchSource, RetrievalResult, RetrieveRequest, ScoredMemory};
pub use retry::RetryPolicy;
pub use scoring::RankingStrategy;
