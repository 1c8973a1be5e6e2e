//! Persistent storage for memories, links and knowledge facts.
//!
//! Three tables back the engine:
//!
//! - **memories**: conversational chunks with tier, importance and embedding
//! - **memory_links**: relations between memories, keyed by either endpoint
//! - **knowledge_cache**: verified facts with confidence
//!
//! Links carry no foreign keys. Traversal code must expect endpoints that
//! have since been consolidated or pruned.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cortex_memory::memory::{ChunkType, MemoryRecord, SqliteMemoryStore};
//!
//! let store = SqliteMemoryStore::in_memory()?;
//! let record = MemoryRecord::new(ChunkType::UserQuery, "How do I rotate keys?");
//! store.insert_memory(&record)?;
//! ```

mod schema;
mod store;
mod types;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{SqliteMemoryStore, StoreBacking, DEFAULT_BUSY_TIMEOUT};
pub use types::{
    ChunkType, FactId, KnowledgeFact, MemoryId, MemoryLink, MemoryRecord, MemoryStats,
    RelationType, Tier, TurnId,
};
