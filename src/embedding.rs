//! Embedding providers and vector utilities.
//!
//! The [`Embedder`] trait is the only seam between the engine and whatever
//! turns text into vectors. Three backends ship with the crate:
//!
//! - [`LocalEmbedder`]: all-MiniLM-L6-v2 sentence embeddings computed
//!   in-process with fastembed (`fastembed-embeddings` feature).
//! - [`ApiEmbedder`]: OpenAI-compatible `/v1/embeddings` endpoint.
//! - [`HashingEmbedder`]: feature-hashed bag of words. Deterministic and
//!   model-free, but lexical only: paraphrases do not land close together,
//!   so the dedup and clustering thresholds lose their meaning.
//!
//! All vectors are L2-normalized. Failures are reported as
//! [`Error::EmbeddingUnavailable`] so callers can degrade instead of abort.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{EmbedderConfig, EmbedderKind};
use crate::error::{Error, Result};

/// Dimensionality of the reference configuration.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Sentence model served by [`LocalEmbedder`].
pub const LOCAL_MODEL_NAME: &str = "all-MiniLM-L6-v2";

/// Text to vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// Build the embedder described by `config`.
pub fn embedder_from_config(config: &EmbedderConfig) -> Arc<dyn Embedder> {
    match config.kind {
        EmbedderKind::Local => {
            if !cfg!(feature = "fastembed-embeddings") {
                warn!("built without fastembed-embeddings, local embeddings are unavailable");
            }
            let mut local = LocalEmbedder::new();
            if let Some(dir) = &config.cache_dir {
                local = local.with_cache_dir(dir.clone());
            }
            Arc::new(local)
        }
        EmbedderKind::Api => Arc::new(ApiEmbedder::new(config.clone())),
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(config.dimensions)),
    }
}

// ==================== Local ====================

/// In-process sentence embedder running all-MiniLM-L6-v2 (384 dimensions).
///
/// The ONNX model is fetched and loaded on first use, on a blocking thread.
/// A failed load is kept and reported by every later call. Without the
/// `fastembed-embeddings` feature every call reports
/// [`Error::EmbeddingUnavailable`].
#[derive(Clone, Default)]
pub struct LocalEmbedder {
    cache_dir: Option<PathBuf>,
    #[cfg(feature = "fastembed-embeddings")]
    model: Arc<std::sync::OnceLock<std::result::Result<fastembed::TextEmbedding, String>>>,
}

impl LocalEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for the downloaded model files.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

#[cfg(feature = "fastembed-embeddings")]
impl LocalEmbedder {
    fn load(&self) -> std::result::Result<fastembed::TextEmbedding, String> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        tracing::info!(model = LOCAL_MODEL_NAME, "loading local embedding model");
        let mut options =
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false);
        if let Some(dir) = &self.cache_dir {
            options = options.with_cache_dir(dir.clone());
        }
        TextEmbedding::try_new(options).map_err(|e| e.to_string())
    }

    fn embed_blocking(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = self
            .model
            .get_or_init(|| self.load())
            .as_ref()
            .map_err(|e| Error::embedding(format!("local model failed to load: {}", e)))?;
        let mut vectors = model
            .embed(texts, None)
            .map_err(|e| Error::embedding(format!("local embedding failed: {}", e)))?;
        vectors.iter_mut().for_each(|v| normalize(v));
        Ok(vectors)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || embedder.embed_blocking(texts))
            .await
            .map_err(|e| Error::embedding(format!("embedding task failed: {}", e)))?
    }
}

#[cfg(not(feature = "fastembed-embeddings"))]
impl LocalEmbedder {
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::embedding(
            "local embeddings require the fastembed-embeddings feature",
        ))
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::embedding("local model returned no embeddings"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_texts(texts).await
    }

    fn dimensions(&self) -> usize {
        DEFAULT_DIMENSIONS
    }

    fn name(&self) -> &str {
        "local"
    }
}

// ==================== Hashing ====================

/// Model-free embedder using signed feature hashing.
///
/// Each lower-cased word and adjacent word pair is hashed to a bucket and a
/// sign. Only shared vocabulary brings texts together; identical texts
/// produce identical vectors.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Compute the vector synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        let mut vector = vec![0.0f32; self.dimensions];
        for word in &words {
            self.accumulate(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ==================== API ====================

/// Remote embedder speaking the OpenAI embeddings protocol.
pub struct ApiEmbedder {
    config: EmbedderConfig,
    http: Option<Client>,
}

impl ApiEmbedder {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: EmbedderConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .ok();
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for ApiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::embedding("provider returned no embeddings"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if !self.config.provider.eq_ignore_ascii_case("openai") {
            return Err(Error::embedding(format!(
                "API embeddings for provider '{}' are not implemented",
                self.config.provider
            )));
        }
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::embedding("no API key configured for embeddings"))?;
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| Error::embedding("HTTP client could not be created"))?;

        let url = format!("{}/v1/embeddings", self.base_url());
        debug!(url = %url, count = texts.len(), "requesting embeddings");

        let response = http
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&EmbeddingRequest {
                model: &self.config.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| Error::embedding(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::embedding(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::embedding(format!(
                "embedding API error ({}): {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| Error::embedding(format!("Failed to parse response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(Error::embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed
            .data
            .into_iter()
            .map(|d| {
                let mut v = d.embedding;
                normalize(&mut v);
                v
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "api"
    }
}

// ==================== Vector utilities ====================

/// Cosine similarity. Zero vectors and mismatched lengths score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Encode as little-endian f32 bytes for BLOB storage.
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`serialize_embedding`]. Trailing bytes that do
/// not form a whole f32 are ignored.
pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
