//! fastembed-backed encoder and re-ranker.
//!
//! Both models are downloaded into `cache_dir/models` on first use. Model
//! calls need `&mut self`, so each instance sits behind a Mutex, which also
//! serializes calls into one model.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank};

use super::{EmbeddingError, PairScorer, TextEncoder};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub struct FastEmbedEncoder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
    special_tokens: usize,
}

pub struct FastEmbedReranker {
    model: Mutex<TextRerank>,
    model_name: String,
    batch_size: usize,
}

fn models_dir(cache_dir: PathBuf) -> Result<PathBuf, EmbeddingError> {
    let models_dir = cache_dir.join("models");
    std::fs::create_dir_all(&models_dir).map_err(|e| {
        EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
    })?;
    Ok(models_dir)
}

/// Run a model constructor on a helper thread and stop waiting after
/// `timeout`. The first run downloads model files.
fn init_with_timeout<T, F>(timeout: Option<Duration>, init: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    let timeout = timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
    let (tx, rx) = mpsc::channel();

    std::thread::Builder::new()
        .name("model-init".to_string())
        .spawn(move || {
            let _ = tx.send(init());
        })
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to spawn init thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(EmbeddingError::DownloadTimeout(timeout.as_secs())),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
            "Model init thread exited without a result".to_string(),
        )),
    }
}

impl FastEmbedEncoder {
    /// Load (downloading if needed) the named bi-encoder.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let models_dir = models_dir(cache_dir)?;

        let mut model = init_with_timeout(download_timeout, move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);
            TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
        })?;

        // Get model dimensions by embedding a test string
        let dimensions = Self::probe_dimensions(&mut model)?;
        let special_tokens = model
            .tokenizer
            .encode("", true)
            .map(|encoding| encoding.get_ids().len())
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
            special_tokens,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized base/large)",
                name
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TextEmbedding>, EmbeddingError> {
        self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })
    }
}

impl TextEncoder for FastEmbedEncoder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, EmbeddingError> {
        let mut model = self.lock()?;

        // The bundled tokenizer truncates to the model window; windowing needs
        // every token, so truncation is lifted for this call only.
        let truncation = model.tokenizer.get_truncation().cloned();
        model
            .tokenizer
            .with_truncation(None)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let encoded = model.tokenizer.encode(text, false);

        model
            .tokenizer
            .with_truncation(truncation)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let encoding = encoded.map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String, EmbeddingError> {
        let model = self.lock()?;
        model
            .tokenizer
            .decode(ids, true)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.lock()?;
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }

    fn special_tokens(&self) -> usize {
        self.special_tokens
    }
}

impl FastEmbedReranker {
    /// Load (downloading if needed) the named cross-encoder.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        batch_size: usize,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let models_dir = models_dir(cache_dir)?;

        let model = init_with_timeout(download_timeout, move || {
            let options = RerankInitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);
            TextRerank::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
        })?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    fn parse_model_name(name: &str) -> Result<RerankerModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "bge-reranker-base" | "bgererankerbase" => Ok(RerankerModel::BGERerankerBase),
            "bge-reranker-v2-m3" | "bgererankerv2m3" => Ok(RerankerModel::BGERerankerV2M3),
            "jina-reranker-v1-turbo-en" | "jinarerankerv1turboen" => {
                Ok(RerankerModel::JINARerankerV1TurboEn)
            }
            "jina-reranker-v2-base-multilingual" | "jinarerankerv2basemultilingual" => {
                Ok(RerankerModel::JINARerankerV2BaseMultiligual)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown re-ranker: {}. Supported models: bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en, jina-reranker-v2-base-multilingual",
                name
            ))),
        }
    }
}

impl PairScorer for FastEmbedReranker {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, EmbeddingError> {
        if documents.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::RerankFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let results = model
            .rerank(query, documents.to_vec(), false, Some(self.batch_size))
            .map_err(|e| EmbeddingError::RerankFailed(e.to_string()))?;

        // results come back sorted by score; put them back in input order
        let mut scores = vec![None; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = Some(result.score);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(i, score)| {
                score.ok_or_else(|| EmbeddingError::RerankFailed(format!("No score for document {}", i)))
            })
            .collect()
    }
}
