//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document or a bare
//! environment yields a usable configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Retention mode for consolidation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    /// Keep everything that is not merged into a summary.
    #[default]
    Full,
    /// Also prune low-importance short-term memories.
    #[serde(alias = "reduced")]
    Standard,
}

impl std::fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Standard => write!(f, "standard"),
        }
    }
}

impl FromStr for RetentionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "standard" | "reduced" => Ok(Self::Standard),
            other => Err(Error::Config(format!("unknown memory tier: {}", other))),
        }
    }
}

/// Which embedding backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    /// all-MiniLM-L6-v2 run in-process through ONNX Runtime
    #[default]
    Local,
    /// OpenAI-compatible HTTP endpoint
    Api,
    /// Lexical feature hashing; no model, no semantic similarity
    Hashing,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub kind: EmbedderKind,
    /// API provider name (only `openai` is implemented)
    pub provider: String,
    /// Model name
    pub model: String,
    /// API key for remote providers
    pub api_key: Option<String>,
    /// Base URL override for remote providers
    pub base_url: Option<String>,
    /// Vector dimensionality for the hashing embedder
    pub dimensions: usize,
    /// Where the local model is downloaded and cached
    pub cache_dir: Option<PathBuf>,
    /// HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::Local,
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            base_url: None,
            dimensions: crate::embedding::DEFAULT_DIMENSIONS,
            cache_dir: None,
            timeout_secs: 30,
        }
    }
}

/// Consolidation job parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Minimum age of short-term memories eligible for clustering.
    pub max_age_days: i64,
    /// Seed similarity required to join a cluster.
    pub cluster_threshold: f32,
    /// Importance below which short-term memories are pruned in standard mode.
    pub prune_threshold: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_age_days: 7,
            cluster_threshold: 0.7,
            prune_threshold: 0.3,
        }
    }
}

/// Configuration for [`crate::MemoryEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database path
    pub db_path: PathBuf,
    pub embedder: EmbedderConfig,
    pub retention_mode: RetentionMode,
    /// Most-recent memories compared against during dedup
    pub dedup_scan_limit: usize,
    /// Most-recent facts scanned per knowledge lookup
    pub fact_scan_limit: usize,
    /// Facts considered for merging into each retrieval
    pub fact_merge_limit: usize,
    /// Link traversal depth for retrieved memories
    pub link_depth: usize,
    /// Number of top results that get link expansion
    pub link_expansion_top: usize,
    /// Recency half-life in days
    pub half_life_days: f64,
    /// Per-call embedding timeout; `None` waits indefinitely
    pub embed_timeout_ms: Option<u64>,
    /// How long a statement waits on another connection's lock
    pub busy_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub consolidation: ConsolidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/memory.db"),
            embedder: EmbedderConfig::default(),
            retention_mode: RetentionMode::Full,
            dedup_scan_limit: 1000,
            fact_scan_limit: crate::knowledge::FACT_SCAN_LIMIT,
            fact_merge_limit: 2,
            link_depth: 1,
            link_expansion_top: 3,
            half_life_days: crate::scoring::DEFAULT_HALF_LIFE_DAYS,
            embed_timeout_ms: None,
            busy_timeout_ms: 5000,
            retry: RetryPolicy::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("MEMORY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(tier) = lookup("MEMORY_TIER") {
            config.retention_mode = tier.parse()?;
        }
        if let Some(kind) = lookup("EMBEDDING_TYPE") {
            config.embedder.kind = match kind.trim().to_ascii_lowercase().as_str() {
                "local" => EmbedderKind::Local,
                "api" => EmbedderKind::Api,
                "hashing" => EmbedderKind::Hashing,
                other => {
                    return Err(Error::Config(format!("unknown embedding type: {}", other)))
                }
            };
        }
        if let Some(provider) = lookup("EMBEDDING_PROVIDER") {
            config.embedder.provider = provider;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            config.embedder.model = model;
        }
        if let Some(key) = lookup("EMBEDDING_API_KEY") {
            config.embedder.api_key = Some(key);
        }
        if let Some(url) = lookup("EMBEDDING_BASE_URL") {
            config.embedder.base_url = Some(url);
        }
        if let Some(dir) = lookup("EMBEDDING_CACHE_DIR") {
            config.embedder.cache_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn with_retention_mode(mut self, mode: RetentionMode) -> Self {
        self.retention_mode = mode;
        self
    }

    pub fn with_embedder(mut self, embedder: EmbedderConfig) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_link_depth(mut self, depth: usize) -> Self {
        self.link_depth = depth;
        self
    }

    pub fn with_dedup_scan_limit(mut self, limit: usize) -> Self {
        self.dedup_scan_limit = limit;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_consolidation(mut self, consolidation: ConsolidationConfig) -> Self {
        self.consolidation = consolidation;
        self
    }

    pub fn embed_timeout(&self) -> Option<Duration> {
        self.embed_timeout_ms.map(Duration::from_millis)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup_scan_limit, 1000);
        assert_eq!(config.fact_scan_limit, 500);
        assert_eq!(config.link_depth, 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.consolidation.max_age_days, 7);
        assert_eq!(config.embedder.dimensions, 384);
        assert_eq!(config.embedder.kind, EmbedderKind::Local);
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("MEMORY_DB_PATH", "/tmp/mem.db"),
            ("MEMORY_TIER", "standard"),
            ("EMBEDDING_TYPE", "api"),
            ("EMBEDDING_API_KEY", "sk-test"),
            ("EMBEDDING_CACHE_DIR", "/var/cache/models"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/mem.db"));
        assert_eq!(config.retention_mode, RetentionMode::Standard);
        assert_eq!(config.embedder.kind, EmbedderKind::Api);
        assert_eq!(config.embedder.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            config.embedder.cache_dir,
            Some(PathBuf::from("/var/cache/models"))
        );
    }

    #[test]
    fn test_hashing_embedder_selectable() {
        let config = EngineConfig::from_lookup(|k| {
            (k == "EMBEDDING_TYPE").then(|| "Hashing".to_string())
        })
        .unwrap();
        assert_eq!(config.embedder.kind, EmbedderKind::Hashing);
    }

    #[test]
    fn test_from_lookup_rejects_unknown_tier() {
        let result = EngineConfig::from_lookup(|k| {
            (k == "MEMORY_TIER").then(|| "forever".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{"db_path": "mem.db", "retention_mode": "standard", "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("mem.db"));
        assert_eq!(config.retention_mode, RetentionMode::Standard);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.link_expansion_top, 3);
    }
}
