//! Inference seams.
//!
//! - `TextEncoder`: bi-encoder turning text into vectors (plus its tokenizer)
//! - `PairScorer`: cross-encoder scoring (query, document) pairs
//! - `ChunkedEmbedder`: windowing + attention pooling on top of an encoder
//! - `ModelProvider`: owns the process-wide model instances, built lazily once

pub mod backend;
pub mod chunked;
pub mod pooling;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::config::Config;
pub use chunked::ChunkedEmbedder;
pub use pooling::AttentionPooler;

/// Error type for embedding and re-ranking operations.
///
/// `Clone` so a failed model construction can be handed to every caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Re-ranking failed: {0}")]
    RerankFailed(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding has zero norm")]
    ZeroNorm,
}

/// Bi-encoder used for both documents and queries.
pub trait TextEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Token ids for `text`, without special tokens and without truncation.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, EmbeddingError>;

    /// Text for a run of token ids produced by `tokenize`.
    fn detokenize(&self, ids: &[u32]) -> Result<String, EmbeddingError>;

    /// Raw (not necessarily normalized) vectors, one per input text.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Tokens `embed_batch` adds around every input ([CLS]/[SEP] and the
    /// like). They count against the model window.
    fn special_tokens(&self) -> usize {
        0
    }
}

/// Cross-encoder scoring a query against candidate documents.
pub trait PairScorer: Send + Sync {
    fn name(&self) -> &str;

    /// One score per document, aligned with `documents` by index.
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, EmbeddingError>;
}

/// Scale `v` to unit length.
pub fn l2_normalize(v: &mut [f32]) -> Result<(), EmbeddingError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(EmbeddingError::ZeroNorm);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(())
}

type EmbedderFactory = Box<dyn Fn() -> Result<ChunkedEmbedder, EmbeddingError> + Send + Sync>;
type ScorerFactory = Box<dyn Fn() -> Result<Arc<dyn PairScorer>, EmbeddingError> + Send + Sync>;

/// Owner of the embedding and re-ranking models.
///
/// Each model is constructed on first use, exactly once. A construction
/// failure is remembered: every later call gets the same error instead of
/// retrying the download.
pub struct ModelProvider {
    embedder: OnceCell<Result<Arc<ChunkedEmbedder>, EmbeddingError>>,
    reranker: OnceCell<Result<Arc<dyn PairScorer>, EmbeddingError>>,
    embedder_factory: Option<EmbedderFactory>,
    reranker_factory: Option<ScorerFactory>,
}

impl ModelProvider {
    /// Provider backed by fastembed models cached under `cache_dir/models`.
    pub fn from_config(config: &Config, cache_dir: PathBuf) -> Self {
        let emb = config.embedding.clone();
        let rerank = config.reranker.clone();
        let timeout = Duration::from_secs(emb.download_timeout_secs);
        let emb_cache = cache_dir.clone();

        let embedder_factory: EmbedderFactory = Box::new(move || {
            let encoder = backend::FastEmbedEncoder::new(&emb.model, emb_cache.clone(), Some(timeout))?;
            let pooler = match &emb.pooler_weights {
                Some(path) => AttentionPooler::from_json_file(path, encoder.dimensions())?,
                None => AttentionPooler::seeded(encoder.dimensions(), emb.pooler_hidden, emb.pooler_seed),
            };
            ChunkedEmbedder::new(Arc::new(encoder), pooler, emb.max_length, emb.overlap, emb.batch_size)
        });

        let reranker_factory: ScorerFactory = Box::new(move || {
            let scorer = backend::FastEmbedReranker::new(
                &rerank.model,
                cache_dir.clone(),
                rerank.batch_size,
                Some(timeout),
            )?;
            Ok(Arc::new(scorer) as Arc<dyn PairScorer>)
        });

        Self {
            embedder: OnceCell::new(),
            reranker: OnceCell::new(),
            embedder_factory: Some(embedder_factory),
            reranker_factory: Some(reranker_factory),
        }
    }

    /// Provider over already constructed models.
    pub fn with_models(embedder: ChunkedEmbedder, reranker: Arc<dyn PairScorer>) -> Self {
        Self {
            embedder: OnceCell::with_value(Ok(Arc::new(embedder))),
            reranker: OnceCell::with_value(Ok(reranker)),
            embedder_factory: None,
            reranker_factory: None,
        }
    }

    pub fn embedder(&self) -> Result<Arc<ChunkedEmbedder>, EmbeddingError> {
        self.embedder
            .get_or_init(|| {
                log::info!("Loading embedding model");
                let built = match &self.embedder_factory {
                    Some(factory) => factory().map(Arc::new),
                    None => Err(EmbeddingError::InitFailed("no embedding model configured".into())),
                };
                match &built {
                    Ok(embedder) => log::info!(
                        "Embedding model {} ready ({} dimensions)",
                        embedder.model_name(),
                        embedder.dimensions()
                    ),
                    Err(e) => log::error!("Embedding model failed to load: {}", e),
                }
                built
            })
            .clone()
    }

    pub fn reranker(&self) -> Result<Arc<dyn PairScorer>, EmbeddingError> {
        self.reranker
            .get_or_init(|| {
                log::info!("Loading re-ranking model");
                let built = match &self.reranker_factory {
                    Some(factory) => factory(),
                    None => Err(EmbeddingError::InitFailed("no re-ranking model configured".into())),
                };
                match &built {
                    Ok(scorer) => log::info!("Re-ranking model {} ready", scorer.name()),
                    Err(e) => log::error!("Re-ranking model failed to load: {}", e),
                }
                built
            })
            .clone()
    }
}
