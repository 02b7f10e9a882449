use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::retriever::SearchMode;
use crate::store::ann::IndexKind;
use crate::store::write_atomic;

const CONFIG_FILE: &str = "config.yaml";

/// Default bi-encoder (matches the dimension the catalog was tuned for)
const DEFAULT_EMBEDDING_MODEL: &str = "bge-large-en-v1.5";
const DEFAULT_RERANKER_MODEL: &str = "bge-reranker-base";
const DEFAULT_MAX_LENGTH: usize = 512;
const DEFAULT_OVERLAP: usize = 20;
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_POOLER_HIDDEN: usize = 128;
const DEFAULT_POOLER_SEED: u64 = 42;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_TOP_K: usize = 5;
const MAX_TOP_K: usize = 50;
const DEFAULT_RETRIEVAL_K: usize = 20;
const DEFAULT_LATENCY_TARGET_MS: u64 = 200;

const DEFAULT_HNSW_M: usize = 16;
const DEFAULT_HNSW_EF_CONSTRUCTION: usize = 200;
const DEFAULT_HNSW_EF_SEARCH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Bi-encoder model name (e.g. "bge-base-en-v1.5")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Window size in tokens; longer texts are chunked
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Tokens shared by consecutive windows
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_pooler_hidden")]
    pub pooler_hidden: usize,

    #[serde(default = "default_pooler_seed")]
    pub pooler_seed: u64,

    /// Optional JSON file with trained pooler weights
    #[serde(default)]
    pub pooler_weights: Option<PathBuf>,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RerankerConfig {
    #[serde(default = "default_reranker_model")]
    pub model: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "max_top_k")]
    pub max_top_k: usize,

    /// Dense candidates handed to the re-ranker
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,

    #[serde(default)]
    pub default_mode: SearchMode,

    /// Advisory only; slower queries are logged, never cancelled
    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnConfig {
    #[serde(default)]
    pub kind: IndexKind,

    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,

    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,

    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,

    #[serde(default = "default_max_brand_length")]
    pub max_brand_length: usize,

    #[serde(default = "default_max_ingredients_length")]
    pub max_ingredients_length: usize,

    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Committed generations kept on disk, including the live one
    #[serde(default = "default_keep_generations")]
    pub keep_generations: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_top_brands")]
    pub top_brands: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_length: DEFAULT_MAX_LENGTH,
            overlap: DEFAULT_OVERLAP,
            batch_size: DEFAULT_BATCH_SIZE,
            pooler_hidden: DEFAULT_POOLER_HIDDEN,
            pooler_seed: DEFAULT_POOLER_SEED,
            pooler_weights: None,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_RERANKER_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: MAX_TOP_K,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            default_mode: SearchMode::default(),
            latency_target_ms: DEFAULT_LATENCY_TARGET_MS,
        }
    }
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::default(),
            hnsw_m: DEFAULT_HNSW_M,
            hnsw_ef_construction: DEFAULT_HNSW_EF_CONSTRUCTION,
            hnsw_ef_search: DEFAULT_HNSW_EF_SEARCH,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_name_length: default_max_name_length(),
            max_brand_length: default_max_brand_length(),
            max_ingredients_length: default_max_ingredients_length(),
            max_text_length: default_max_text_length(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keep_generations: default_keep_generations(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            top_brands: default_top_brands(),
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_reranker_model() -> String {
    DEFAULT_RERANKER_MODEL.to_string()
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_overlap() -> usize {
    DEFAULT_OVERLAP
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_pooler_hidden() -> usize {
    DEFAULT_POOLER_HIDDEN
}

fn default_pooler_seed() -> u64 {
    DEFAULT_POOLER_SEED
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn max_top_k() -> usize {
    MAX_TOP_K
}

fn default_retrieval_k() -> usize {
    DEFAULT_RETRIEVAL_K
}

fn default_latency_target_ms() -> u64 {
    DEFAULT_LATENCY_TARGET_MS
}

fn default_hnsw_m() -> usize {
    DEFAULT_HNSW_M
}

fn default_hnsw_ef_construction() -> usize {
    DEFAULT_HNSW_EF_CONSTRUCTION
}

fn default_hnsw_ef_search() -> usize {
    DEFAULT_HNSW_EF_SEARCH
}

fn default_max_name_length() -> usize {
    200
}

fn default_max_brand_length() -> usize {
    100
}

fn default_max_ingredients_length() -> usize {
    1000
}

fn default_max_text_length() -> usize {
    2000
}

fn default_keep_generations() -> usize {
    2
}

fn default_top_brands() -> usize {
    10
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ann: AnnConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        let emb = &self.embedding;
        if emb.max_length == 0 {
            return invalid("embedding.max_length must be greater than 0".into());
        }
        if emb.overlap >= emb.max_length {
            return invalid(format!(
                "embedding.overlap ({}) must be smaller than embedding.max_length ({})",
                emb.overlap, emb.max_length
            ));
        }
        if emb.batch_size == 0 || self.reranker.batch_size == 0 {
            return invalid("batch_size must be greater than 0".into());
        }
        if emb.pooler_hidden == 0 {
            return invalid("embedding.pooler_hidden must be greater than 0".into());
        }
        if emb.download_timeout_secs == 0 {
            return invalid("embedding.download_timeout_secs must be greater than 0".into());
        }

        let search = &self.search;
        if search.max_top_k == 0 || search.max_top_k > MAX_TOP_K {
            return invalid(format!(
                "search.max_top_k must be between 1 and {MAX_TOP_K}, got {}",
                search.max_top_k
            ));
        }
        if search.default_top_k == 0 || search.default_top_k > search.max_top_k {
            return invalid(format!(
                "search.default_top_k must be between 1 and {}, got {}",
                search.max_top_k, search.default_top_k
            ));
        }
        if search.retrieval_k == 0 {
            return invalid("search.retrieval_k must be greater than 0".into());
        }

        if self.ann.hnsw_m < 2 {
            return invalid(format!("ann.hnsw_m must be at least 2, got {}", self.ann.hnsw_m));
        }
        if self.ann.hnsw_ef_construction == 0 || self.ann.hnsw_ef_search == 0 {
            return invalid("ann ef parameters must be greater than 0".into());
        }

        if self.storage.keep_generations == 0 {
            return invalid("storage.keep_generations must be at least 1".into());
        }

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path)?;
            write_atomic(&path, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = std::fs::read_to_string(&path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        write_atomic(&self.base_path.join(CONFIG_FILE), config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
