#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{RagError, Result};

/// Top-level service configuration, loaded from `config.toml`.
///
/// Every section has working defaults so a missing file yields a usable
/// local setup (Ollama on 11434, Qdrant on 6333). All values are validated
/// on load; an invalid configuration refuses to start the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub limits: LimitsConfig,
    pub flow_log: FlowLogConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            chunking: ChunkConfig::default(),
            retrieval: RetrievalConfig::default(),
            limits: LimitsConfig::default(),
            flow_log: FlowLogConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub host: String,
    pub model: String,
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            timeout_s: 60,
        }
    }
}

impl LlmConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub host: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub retries: u32,
    pub backoff_initial_s: f64,
    pub backoff_factor: f64,
    pub inter_batch_delay_s: f64,
    pub timeout_s: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "bge-m3".to_string(),
            dimension: 1024,
            batch_size: 16,
            retries: 5,
            backoff_initial_s: 1.5,
            backoff_factor: 1.5,
            inter_batch_delay_s: 0.0,
            timeout_s: 30,
        }
    }
}

impl EmbeddingConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub url: String,
    pub default_collection: String,
    pub upsert_batch_size: usize,
    pub retries: u32,
    pub timeout_s: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            default_collection: "knowledge_base".to_string(),
            upsert_batch_size: 100,
            retries: 3,
            timeout_s: 10,
        }
    }
}

impl VectorStoreConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

/// Chunking parameters. Also embedded per-KB; the section here provides the
/// defaults used when a knowledge base is created without explicit values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub respect_sentence_boundary: bool,
    pub chinese_aware: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            respect_sentence_boundary: true,
            chinese_aware: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Vector,
    Fulltext,
    Hybrid,
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RetrievalMode::Vector => write!(f, "vector"),
            RetrievalMode::Fulltext => write!(f, "fulltext"),
            RetrievalMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for RetrievalMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(RetrievalMode::Vector),
            "fulltext" => Ok(RetrievalMode::Fulltext),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(RagError::Validation(format!(
                "unknown retrieval mode '{other}' (expected vector, fulltext, or hybrid)"
            ))),
        }
    }
}

/// Retrieval parameters. Like [`ChunkConfig`], doubles as the per-KB default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub adaptive_min_threshold: f32,
    pub adaptive_target_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Vector,
            top_k: 5,
            similarity_threshold: 0.5,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            adaptive_min_threshold: 0.1,
            adaptive_target_results: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_query_length: usize,
    pub max_file_size_bytes: u64,
    pub ingest_worker_pool: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_query_length: 2000,
            max_file_size_bytes: 100 * 1024 * 1024,
            ingest_worker_pool: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDetailLevel {
    Minimal,
    Normal,
    Verbose,
}

impl std::fmt::Display for FlowDetailLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FlowDetailLevel::Minimal => write!(f, "minimal"),
            FlowDetailLevel::Normal => write!(f, "normal"),
            FlowDetailLevel::Verbose => write!(f, "verbose"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowLogConfig {
    pub path: String,
    pub detail_level: FlowDetailLevel,
    pub queue_capacity: usize,
}

impl Default for FlowLogConfig {
    fn default() -> Self {
        Self {
            path: "logs/flow.log".to_string(),
            detail_level: FlowDetailLevel::Normal,
            queue_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from `<config_dir>/config.toml`, falling back to
    /// defaults when the file is absent.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(|e| {
                RagError::Config(format!(
                    "failed to read config file {}: {e}",
                    config_path.display()
                ))
            })?;
            toml::from_str::<Config>(&content).map_err(|e| {
                RagError::Config(format!(
                    "failed to parse config file {}: {e}",
                    config_path.display()
                ))
            })?
        } else {
            Config::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        config.validate()?;
        Ok(config)
    }

    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("metadata.db")
    }

    #[inline]
    pub fn flow_log_path(&self) -> PathBuf {
        self.base_dir.join(&self.flow_log.path)
    }

    /// Validate every recognized key. Called on startup; a failure here is a
    /// `RagError::Config` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.llm.host)
            .map_err(|e| RagError::Config(format!("llm.host is not a valid URL: {e}")))?;
        Url::parse(&self.embedding.host)
            .map_err(|e| RagError::Config(format!("embedding.host is not a valid URL: {e}")))?;
        Url::parse(&self.vector_store.url)
            .map_err(|e| RagError::Config(format!("vector_store.url is not a valid URL: {e}")))?;

        if self.llm.timeout_s == 0 {
            return Err(RagError::Config("llm.timeout_s must be positive".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(RagError::Config(
                "embedding.dimension must be positive".into(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Config(
                "embedding.batch_size must be positive".into(),
            ));
        }
        if self.embedding.backoff_initial_s <= 0.0 || self.embedding.backoff_factor < 1.0 {
            return Err(RagError::Config(
                "embedding backoff must have a positive initial delay and a factor >= 1.0".into(),
            ));
        }
        if self.embedding.inter_batch_delay_s < 0.0 || self.embedding.inter_batch_delay_s > 4.0 {
            return Err(RagError::Config(
                "embedding.inter_batch_delay_s must be within 0..=4 seconds".into(),
            ));
        }
        if self.vector_store.upsert_batch_size == 0 {
            return Err(RagError::Config(
                "vector_store.upsert_batch_size must be positive".into(),
            ));
        }

        validate_chunk_config(&self.chunking)?;
        validate_retrieval_config(&self.retrieval)?;

        if self.limits.max_query_length == 0 {
            return Err(RagError::Config(
                "limits.max_query_length must be positive".into(),
            ));
        }
        if self.limits.max_file_size_bytes == 0 {
            return Err(RagError::Config(
                "limits.max_file_size_bytes must be positive".into(),
            ));
        }
        if self.limits.ingest_worker_pool == 0 {
            return Err(RagError::Config(
                "limits.ingest_worker_pool must be positive".into(),
            ));
        }
        if self.flow_log.queue_capacity == 0 {
            return Err(RagError::Config(
                "flow_log.queue_capacity must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Shared with the per-KB configuration path: a KB created or updated with an
/// invalid chunking setup is rejected with the same rules as startup config.
pub fn validate_chunk_config(config: &ChunkConfig) -> Result<()> {
    if config.chunk_size == 0 {
        return Err(RagError::Config("chunk_size must be positive".into()));
    }
    if config.chunk_overlap >= config.chunk_size {
        return Err(RagError::Config(format!(
            "chunk_overlap ({}) must be less than chunk_size ({})",
            config.chunk_overlap, config.chunk_size
        )));
    }
    Ok(())
}

pub fn validate_retrieval_config(config: &RetrievalConfig) -> Result<()> {
    if config.top_k == 0 {
        return Err(RagError::Config("top_k must be positive".into()));
    }
    for (name, value) in [
        ("similarity_threshold", config.similarity_threshold),
        ("adaptive_min_threshold", config.adaptive_min_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(RagError::Config(format!("{name} must be within 0..=1")));
        }
    }
    let weight_sum = config.vector_weight + config.keyword_weight;
    if (weight_sum - 1.0).abs() > 1e-6 {
        return Err(RagError::Config(format!(
            "vector_weight + keyword_weight must sum to 1.0 (got {weight_sum})"
        )));
    }
    if config.vector_weight < 0.0 || config.keyword_weight < 0.0 {
        return Err(RagError::Config(
            "retrieval weights must not be negative".into(),
        ));
    }
    if config.adaptive_target_results == 0 {
        return Err(RagError::Config(
            "adaptive_target_results must be positive".into(),
        ));
    }
    Ok(())
}
