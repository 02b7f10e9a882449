//! Deterministic stand-ins for the inference models.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::models::{AttentionPooler, ChunkedEmbedder, EmbeddingError, ModelProvider, PairScorer, TextEncoder};
use crate::service::CatalogService;

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

#[derive(Default)]
struct Vocab {
    ids: HashMap<String, u32>,
    words: Vec<String>,
}

/// Word-level encoder: every new word gets the next id, and a text embeds
/// to the bag of its word ids folded into `dims` slots. With fewer distinct
/// words than `dims` no two words share a slot.
pub struct VocabEncoder {
    dims: usize,
    vocab: Mutex<Vocab>,
    failing: AtomicBool,
    special_tokens: usize,
    model_window: Option<usize>,
}

impl VocabEncoder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vocab: Mutex::new(Vocab::default()),
            failing: AtomicBool::new(false),
            special_tokens: 0,
            model_window: None,
        }
    }

    /// Act like a transformer that wraps every input in `special_tokens`
    /// extra tokens and refuses inputs longer than `model_window` in total.
    pub fn with_model_window(mut self, special_tokens: usize, model_window: usize) -> Self {
        self.special_tokens = special_tokens;
        self.model_window = Some(model_window);
        self
    }

    /// Make every later `embed_batch` call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TextEncoder for VocabEncoder {
    fn name(&self) -> &str {
        "vocab-test-encoder"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, EmbeddingError> {
        let mut vocab = self.vocab.lock().unwrap();
        Ok(words(text)
            .map(|word| match vocab.ids.get(&word) {
                Some(&id) => id,
                None => {
                    let id = vocab.words.len() as u32;
                    vocab.ids.insert(word.clone(), id);
                    vocab.words.push(word);
                    id
                }
            })
            .collect())
    }

    fn special_tokens(&self) -> usize {
        self.special_tokens
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String, EmbeddingError> {
        let vocab = self.vocab.lock().unwrap();
        ids.iter()
            .map(|&id| {
                vocab
                    .words
                    .get(id as usize)
                    .cloned()
                    .ok_or_else(|| EmbeddingError::Tokenizer(format!("unknown token {id}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|w| w.join(" "))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed("encoder switched off".into()));
        }

        texts
            .iter()
            .map(|text| {
                let ids = self.tokenize(text)?;
                if let Some(limit) = self.model_window {
                    if ids.len() + self.special_tokens > limit {
                        return Err(EmbeddingError::EmbeddingFailed(format!(
                            "{} tokens do not fit a {limit}-token window",
                            ids.len() + self.special_tokens
                        )));
                    }
                }
                let mut v = vec![0.0; self.dims];
                if ids.is_empty() {
                    v[0] = 1.0;
                }
                for id in ids {
                    v[id as usize % self.dims] += 1.0;
                }
                Ok(v)
            })
            .collect()
    }
}

/// Tokenizes fine, never embeds.
pub struct FailingEncoder {
    inner: VocabEncoder,
}

impl FailingEncoder {
    pub fn new(dims: usize) -> Self {
        let inner = VocabEncoder::new(dims);
        inner.set_failing(true);
        Self { inner }
    }
}

impl TextEncoder for FailingEncoder {
    fn name(&self) -> &str {
        "failing-test-encoder"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, EmbeddingError> {
        self.inner.tokenize(text)
    }

    fn detokenize(&self, ids: &[u32]) -> Result<String, EmbeddingError> {
        self.inner.detokenize(ids)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.embed_batch(texts)
    }
}

/// Cross-encoder stand-in: a document scores the number of distinct query
/// words it contains.
pub struct KeywordScorer;

impl PairScorer for KeywordScorer {
    fn name(&self) -> &str {
        "keyword-test-scorer"
    }

    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>, EmbeddingError> {
        let mut terms: Vec<String> = words(query).collect();
        terms.sort();
        terms.dedup();

        Ok(documents
            .iter()
            .map(|doc| {
                let doc_words: Vec<String> = words(doc).collect();
                terms.iter().filter(|t| doc_words.contains(t)).count() as f32
            })
            .collect())
    }
}

pub fn embedder_over(encoder: Arc<dyn TextEncoder>) -> ChunkedEmbedder {
    let dims = encoder.dimensions();
    ChunkedEmbedder::new(encoder, AttentionPooler::seeded(dims, 8, 42), 64, 8, 4).unwrap()
}

pub fn vocab_embedder(dims: usize) -> ChunkedEmbedder {
    embedder_over(Arc::new(VocabEncoder::new(dims)))
}

pub fn provider(encoder: Arc<VocabEncoder>) -> Arc<ModelProvider> {
    Arc::new(ModelProvider::with_models(embedder_over(encoder), Arc::new(KeywordScorer)))
}

/// Service over `base` backed by `encoder`. Share one encoder between
/// services that reopen the same directory so word ids stay stable.
pub fn open_service(base: &Path, encoder: Arc<VocabEncoder>) -> CatalogService {
    let config = Config::load_with(base).unwrap();
    CatalogService::open(config, provider(encoder)).unwrap()
}

/// Fresh service in a temp dir with room for 256 distinct words.
pub fn fresh_service() -> (CatalogService, Arc<VocabEncoder>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let encoder = Arc::new(VocabEncoder::new(256));
    let service = open_service(tmp.path(), encoder.clone());
    (service, encoder, tmp)
}
