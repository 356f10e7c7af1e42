//! Embedding provider abstraction for pattern description search
//!
//! The vector index stores one embedding per active pattern version and
//! ranks candidates by cosine similarity. Three providers are available:
//!
//! ```text
//! EmbeddingProvider trait
//! ├── HashedProvider (default: deterministic feature hashing, no model)
//! ├── LocalProvider  (fastembed / ONNX, --features local-embeddings)
//! └── RemoteProvider (OpenAI-compatible HTTP API)
//! ```
//!
//! The hashed provider trades recall quality for zero setup: it needs no
//! model download and no network, so a fresh install can rank patterns
//! immediately. Descriptions with overlapping vocabulary score high;
//! true paraphrases need the local or remote provider.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Dimensions of the feature-hashing vector space
pub const HASHED_DIMENSIONS: usize = 256;

/// Dimensions of the default local ONNX model (all-MiniLM-L6-v2)
pub const MINILM_DIMENSIONS: usize = 384;

/// Errors that can occur during embedding operations
#[derive(Debug)]
pub enum EmbeddingError {
    /// Provider is not configured or disabled
    NotConfigured,
    /// API error from remote provider
    ApiError { status: u16, message: String },
    /// Network error
    NetworkError(String),
    /// Model loading error (local provider)
    ModelLoadError(String),
    /// Internal error
    Internal(String),
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "Embedding provider not configured"),
            Self::ApiError { status, message } => {
                write!(f, "API error ({}): {}", status, message)
            }
            Self::NetworkError(msg) => write!(f, "Network error: {}", msg),
            Self::ModelLoadError(msg) => write!(f, "Model load error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// Provider type for configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Deterministic feature hashing (no model, no network)
    #[default]
    Hashed,
    /// Local ONNX model (fastembed-rs)
    Local,
    /// Remote OpenAI-compatible API
    Remote,
    /// No embeddings; the index reports itself unavailable
    None,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hashed => write!(f, "hashed"),
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Configuration for embedding providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which provider to use
    pub provider: ProviderType,
    /// Model name (local: "all-MiniLM-L6-v2"; remote: "text-embedding-3-small")
    pub model: String,
    /// API key for remote providers (or via OPENAI_API_KEY)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// API base URL for remote providers
    pub api_base: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::Hashed,
            model: String::new(),
            api_key: None,
            api_base: None,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Dimensions the configured provider will produce
    pub fn dimensions(&self) -> usize {
        match self.provider {
            ProviderType::Hashed => HASHED_DIMENSIONS,
            ProviderType::Local => MINILM_DIMENSIONS,
            ProviderType::Remote => match self.model.as_str() {
                m if m.contains("3-large") => 3072,
                _ => 1536,
            },
            ProviderType::None => 0,
        }
    }

    /// Get the effective API base URL
    pub fn api_base(&self) -> &str {
        self.api_base
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }
}

/// Trait for embedding providers
///
/// Methods are synchronous; the library calls them from its own worker
/// threads. Providers must be `Send + Sync`.
pub trait EmbeddingProvider: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &'static str;

    /// Get the embedding dimensions for this provider
    fn dimensions(&self) -> usize;

    /// Check if the provider is ready to generate embeddings
    fn is_ready(&self) -> bool;

    /// Generate an embedding for a single text
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Generate embeddings for multiple texts
    ///
    /// Default implementation calls `embed()` per text; providers with
    /// efficient batching should override.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Create an embedding provider from configuration
pub fn create_provider(config: &EmbeddingConfig) -> Box<dyn EmbeddingProvider> {
    match config.provider {
        ProviderType::Hashed => Box::new(HashedProvider::new()),
        ProviderType::None => Box::new(DisabledProvider),
        ProviderType::Local => {
            #[cfg(feature = "local-embeddings")]
            {
                match LocalProvider::new(config) {
                    Ok(provider) => return Box::new(provider),
                    Err(e) => {
                        tracing::error!("Failed to create local embedding provider: {}", e);
                        return Box::new(HashedProvider::new());
                    }
                }
            }
            #[cfg(not(feature = "local-embeddings"))]
            {
                tracing::warn!(
                    "Local embeddings feature not enabled. Build with --features local-embeddings"
                );
                Box::new(HashedProvider::new())
            }
        }
        ProviderType::Remote => match RemoteProvider::new(config) {
            Ok(provider) => Box::new(provider),
            Err(e) => {
                tracing::error!("Failed to create remote embedding provider: {}", e);
                Box::new(HashedProvider::new())
            }
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Hashed Provider (feature hashing, always available)
// ═══════════════════════════════════════════════════════════════════════════

/// Deterministic bag-of-words provider using feature hashing
///
/// Each lowercase alphanumeric token is hashed (FNV-1a) into one of
/// `HASHED_DIMENSIONS` buckets; the resulting count vector is
/// L2-normalized. Cosine similarity then measures vocabulary overlap.
#[derive(Debug, Default)]
pub struct HashedProvider;

impl HashedProvider {
    pub fn new() -> Self {
        Self
    }

    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }

    /// FNV-1a 64-bit; stable across platforms and releases, which matters
    /// because the bucket assignment is persisted in the index
    fn fnv1a(token: &str) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }
}

impl EmbeddingProvider for HashedProvider {
    fn name(&self) -> &'static str {
        "hashed"
    }

    fn dimensions(&self) -> usize {
        HASHED_DIMENSIONS
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut vector = vec![0.0f32; HASHED_DIMENSIONS];
        for token in Self::tokenize(text) {
            let bucket = (Self::fnv1a(&token) % HASHED_DIMENSIONS as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Disabled Provider
// ═══════════════════════════════════════════════════════════════════════════

/// Provider used when embeddings are explicitly disabled
///
/// All operations return `EmbeddingError::NotConfigured`, which the
/// index surfaces as unavailability so search can degrade to keywords.
#[derive(Debug, Default)]
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn embed(&self, _text: &str) -> Result<Embedding, EmbeddingError> {
        Err(EmbeddingError::NotConfigured)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Remote Provider (OpenAI-compatible)
// ═══════════════════════════════════════════════════════════════════════════

/// Remote embedding provider using an OpenAI-compatible embeddings endpoint
pub struct RemoteProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl RemoteProvider {
    /// Create a new remote provider
    ///
    /// # Errors
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or(EmbeddingError::NotConfigured)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                EmbeddingError::NetworkError(format!("Failed to create HTTP client: {}", e))
            })?;

        tracing::info!(
            "Initialized remote embedding provider: {} (model: {})",
            config.api_base(),
            config.model
        );

        Ok(Self {
            client,
            base_url: config.api_base().to_string(),
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions(),
        })
    }
}

/// OpenAI embeddings API response format
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut batch = self.embed_batch(&[text])?;
        batch
            .pop()
            .ok_or_else(|| EmbeddingError::Internal("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .map_err(|e| EmbeddingError::NetworkError(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbeddingError::Internal(format!("Failed to parse response: {}", e)))?;

        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Local Provider (fastembed-rs / ONNX)
// ═══════════════════════════════════════════════════════════════════════════

/// Local embedding provider using ONNX models via fastembed-rs
///
/// The model (~20-80MB) is downloaded on first use.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model: fastembed::TextEmbedding,
    dimensions: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    /// Create a new local provider
    ///
    /// # Errors
    /// Returns an error if the model name is unknown or loading fails.
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model_enum, dimensions) = match config.model.as_str() {
            "all-MiniLM-L6-v2" | "" => (EmbeddingModel::AllMiniLML6V2, MINILM_DIMENSIONS),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            other => {
                return Err(EmbeddingError::ModelLoadError(format!(
                    "Unknown model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
                    other
                )));
            }
        };

        tracing::info!(
            "Loading local embedding model: {} ({} dimensions)",
            config.model,
            dimensions
        );

        let model = TextEmbedding::try_new(InitOptions::new(model_enum)).map_err(|e| {
            EmbeddingError::ModelLoadError(format!("Failed to initialize model: {}", e))
        })?;

        Ok(Self { model, dimensions })
    }
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut embeddings = self
            .model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Internal(format!("Embedding failed: {}", e)))?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::Internal("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|s| (*s).to_string()).collect();
        self.model
            .embed(owned, None)
            .map_err(|e| EmbeddingError::Internal(format!("Batch embedding failed: {}", e)))
    }
}
