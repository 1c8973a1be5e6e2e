//! Core types for stored memories, links and knowledge facts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::scoring::clamp_importance;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier.
            pub fn new() -> Self {
                let hex = uuid::Uuid::new_v4().simple().to_string();
                Self(format!(concat!($prefix, "_{}"), &hex[..12]))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a stored memory record.
    MemoryId,
    "mem"
);
prefixed_id!(
    /// Identifier grouping the chunks of one exchange.
    TurnId,
    "turn"
);
prefixed_id!(
    /// Identifier of a knowledge-cache fact.
    FactId,
    "fact"
);

/// Which side of an exchange a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    UserQuery,
    AgentResponse,
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserQuery => write!(f, "user_query"),
            Self::AgentResponse => write!(f, "agent_response"),
        }
    }
}

impl ChunkType {
    pub fn parse(s: &str) -> Self {
        match s {
            "user_query" => Self::UserQuery,
            _ => Self::AgentResponse,
        }
    }
}

/// Retention class of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ShortTerm,
    LongTerm,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortTerm => write!(f, "short_term"),
            Self::LongTerm => write!(f, "long_term"),
        }
    }
}

impl Tier {
    pub fn parse(s: &str) -> Self {
        match s {
            "long_term" => Self::LongTerm,
            _ => Self::ShortTerm,
        }
    }
}

/// Kind of relation a [`MemoryLink`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    RelatedTo,
    ConsolidatedInto,
    Sibling,
    QueryResponse,
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelatedTo => write!(f, "related_to"),
            Self::ConsolidatedInto => write!(f, "consolidated_into"),
            Self::Sibling => write!(f, "sibling"),
            Self::QueryResponse => write!(f, "query_response"),
        }
    }
}

impl RelationType {
    pub fn parse(s: &str) -> Self {
        match s {
            "consolidated_into" => Self::ConsolidatedInto,
            "sibling" => Self::Sibling,
            "query_response" => Self::QueryResponse,
            _ => Self::RelatedTo,
        }
    }
}

/// A stored unit of conversational content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub content: String,
    pub chunk_type: ChunkType,
    pub turn_id: TurnId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub tier: Tier,
    pub importance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub tags: Vec<String>,
    pub source_agent: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
}

impl MemoryRecord {
    /// Create a short-term record with default importance.
    pub fn new(chunk_type: ChunkType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(),
            content: content.into(),
            chunk_type,
            turn_id: TurnId::new(),
            chunk_index: 0,
            total_chunks: 1,
            tier: Tier::ShortTerm,
            importance: crate::scoring::DEFAULT_IMPORTANCE,
            embedding: None,
            tags: Vec::new(),
            source_agent: String::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            access_count: 0,
        }
    }

    pub fn with_id(mut self, id: MemoryId) -> Self {
        self.id = id;
        self
    }

    pub fn with_turn(mut self, turn_id: TurnId, chunk_index: u32, total_chunks: u32) -> Self {
        self.turn_id = turn_id;
        if self.chunk_type == ChunkType::UserQuery {
            self.chunk_index = 0;
            self.total_chunks = 1;
        } else {
            self.chunk_index = chunk_index;
            self.total_chunks = total_chunks.max(1);
        }
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_agent(mut self, agent: impl Into<String>) -> Self {
        self.source_agent = agent.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Relation between two memory records.
///
/// Links are never updated. They may outlive either endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryLink {
    pub memory_id_a: MemoryId,
    pub memory_id_b: MemoryId,
    pub relation_type: RelationType,
    pub strength: f64,
}

impl MemoryLink {
    pub fn new(a: MemoryId, b: MemoryId, relation_type: RelationType, strength: f64) -> Self {
        Self {
            memory_id_a: a,
            memory_id_b: b,
            relation_type,
            strength: strength.clamp(0.0, 1.0),
        }
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: &MemoryId) -> Option<&MemoryId> {
        if &self.memory_id_a == id {
            Some(&self.memory_id_b)
        } else if &self.memory_id_b == id {
            Some(&self.memory_id_a)
        } else {
            None
        }
    }
}

/// A verified assertion held in the knowledge cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFact {
    pub id: FactId,
    pub fact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source_agent: String,
    pub verified_by: String,
    pub verified_at: DateTime<Utc>,
    pub confidence: f64,
    pub metadata: HashMap<String, Value>,
}

impl KnowledgeFact {
    /// Create a fact verified now by its source agent.
    pub fn new(fact: impl Into<String>, source_agent: impl Into<String>, confidence: f64) -> Self {
        let source_agent = source_agent.into();
        Self {
            id: FactId::new(),
            fact: fact.into(),
            embedding: None,
            verified_by: source_agent.clone(),
            source_agent,
            verified_at: Utc::now(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata: HashMap::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_verified_by(mut self, verifier: impl Into<String>) -> Self {
        self.verified_by = verifier.into();
        self
    }

    pub fn with_verified_at(mut self, at: DateTime<Utc>) -> Self {
        self.verified_at = at;
        self
    }

    pub fn with_metadata_map(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Counts reported by [`crate::memory::SqliteMemoryStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_memories: u64,
    pub short_term: u64,
    pub long_term: u64,
    pub without_embedding: u64,
    pub total_links: u64,
    pub total_facts: u64,
}
