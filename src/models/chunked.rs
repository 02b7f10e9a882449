//! Token-window chunking with attention pooling.
//!
//! `max_length` is the model window including the special tokens the encoder
//! adds. Texts whose content fits in what is left are embedded directly.
//! Longer texts are split into windows of that size where consecutive windows
//! share `overlap` tokens; each window is embedded and normalized, then the
//! windows are combined by the attention pooler.

use std::ops::Range;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{l2_normalize, AttentionPooler, EmbeddingError, TextEncoder};

/// Token ranges covered by each window of a `len`-token text.
///
/// Window `i` starts at `i * (max_length - overlap)`; the last windows may be
/// shorter than `max_length`.
pub fn window_ranges(len: usize, max_length: usize, overlap: usize) -> Vec<Range<usize>> {
    let stride = max_length.saturating_sub(overlap).max(1);
    (0..len)
        .step_by(stride)
        .map(|start| start..(start + max_length).min(len))
        .collect()
}

pub struct ChunkedEmbedder {
    encoder: Arc<dyn TextEncoder>,
    pooler: AttentionPooler,
    /// Content tokens per window: `max_length` minus the special tokens
    window: usize,
    overlap: usize,
    batch_size: usize,
    fingerprint: [u8; 32],
}

enum Pending {
    Direct,
    Windows(Vec<String>),
}

impl ChunkedEmbedder {
    pub fn new(
        encoder: Arc<dyn TextEncoder>,
        pooler: AttentionPooler,
        max_length: usize,
        overlap: usize,
        batch_size: usize,
    ) -> Result<Self, EmbeddingError> {
        let window = max_length.saturating_sub(encoder.special_tokens());
        if window == 0 || overlap >= window {
            return Err(EmbeddingError::InitFailed(format!(
                "window overlap {} must be smaller than max_length {} less {} special tokens",
                overlap,
                max_length,
                encoder.special_tokens()
            )));
        }
        if pooler.dimensions() != encoder.dimensions() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: encoder.dimensions(),
                got: pooler.dimensions(),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(encoder.name().as_bytes());
        hasher.update((max_length as u64).to_le_bytes());
        hasher.update((window as u64).to_le_bytes());
        hasher.update((overlap as u64).to_le_bytes());
        pooler.fingerprint(&mut hasher);
        let fingerprint = hasher.finalize().into();

        Ok(Self {
            encoder,
            pooler,
            window,
            overlap,
            batch_size: batch_size.max(1),
            fingerprint,
        })
    }

    pub fn model_name(&self) -> &str {
        self.encoder.name()
    }

    pub fn dimensions(&self) -> usize {
        self.encoder.dimensions()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Identifies every parameter that influences the produced vectors.
    /// Stored with persisted vectors; a mismatch means they must be recomputed.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Embed one text into a unit-norm vector.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_many(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    /// Embed many texts, batching short texts and the windows of long ones
    /// through the encoder. Output order matches input order.
    pub fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut plan = Vec::with_capacity(texts.len());
        for text in texts {
            let ids = self.encoder.tokenize(text)?;
            if ids.len() <= self.window {
                plan.push(Pending::Direct);
            } else {
                let windows = window_ranges(ids.len(), self.window, self.overlap)
                    .into_iter()
                    .map(|range| self.encoder.detokenize(&ids[range]))
                    .collect::<Result<Vec<_>, _>>()?;
                log::debug!(
                    "Chunked {} tokens into {} windows",
                    ids.len(),
                    windows.len()
                );
                plan.push(Pending::Windows(windows));
            }
        }

        let direct: Vec<String> = texts
            .iter()
            .zip(&plan)
            .filter(|(_, p)| matches!(p, Pending::Direct))
            .map(|(t, _)| t.clone())
            .collect();
        let mut direct_vectors = self.encode_normalized(&direct)?.into_iter();

        let mut out = Vec::with_capacity(texts.len());
        for pending in plan {
            match pending {
                Pending::Direct => {
                    let vector = direct_vectors.next().ok_or_else(|| {
                        EmbeddingError::EmbeddingFailed("Encoder returned too few vectors".to_string())
                    })?;
                    out.push(vector);
                }
                Pending::Windows(windows) => {
                    let window_vectors = self.encode_normalized(&windows)?;
                    out.push(self.pooler.pool(&window_vectors)?);
                }
            }
        }

        Ok(out)
    }

    /// Run the encoder in batches and normalize every output.
    fn encode_normalized(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.encoder.embed_batch(batch)?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "Encoder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for mut vector in vectors {
                if vector.len() != self.dimensions() {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: self.dimensions(),
                        got: vector.len(),
                    });
                }
                l2_normalize(&mut vector)?;
                out.push(vector);
            }
        }
        Ok(out)
    }
}
