//! Attention pooling over window embeddings.
//!
//! Scorer: `Linear(D -> hidden) -> tanh -> Linear(hidden -> 1)`. Softmax over
//! window scores gives the weights; the pooled vector is the weighted sum,
//! renormalized to unit length.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionPooler {
    dimensions: usize,
    hidden: usize,
    /// hidden x dimensions, row-major
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: f32,
}

impl AttentionPooler {
    /// Xavier-uniform weights drawn from a seeded generator, zero biases.
    /// Same seed and shape always yield the same weights.
    pub fn seeded(dimensions: usize, hidden: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let limit1 = (6.0 / (dimensions + hidden) as f32).sqrt();
        let w1 = (0..hidden * dimensions)
            .map(|_| rng.random_range(-limit1..limit1))
            .collect();

        let limit2 = (6.0 / (hidden + 1) as f32).sqrt();
        let w2 = (0..hidden).map(|_| rng.random_range(-limit2..limit2)).collect();

        Self {
            dimensions,
            hidden,
            w1,
            b1: vec![0.0; hidden],
            w2,
            b2: 0.0,
        }
    }

    /// Load trained weights from a JSON file with the same field layout.
    pub fn from_json_file(path: &Path, dimensions: usize) -> Result<Self, EmbeddingError> {
        let data = std::fs::read(path).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to read pooler weights {}: {}", path.display(), e))
        })?;
        let pooler: Self = serde_json::from_slice(&data)
            .map_err(|e| EmbeddingError::InitFailed(format!("Malformed pooler weights: {}", e)))?;

        if pooler.dimensions != dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimensions,
                got: pooler.dimensions,
            });
        }
        if pooler.w1.len() != pooler.hidden * pooler.dimensions
            || pooler.b1.len() != pooler.hidden
            || pooler.w2.len() != pooler.hidden
        {
            return Err(EmbeddingError::InitFailed(
                "Pooler weight shapes do not match dimensions/hidden".to_string(),
            ));
        }

        Ok(pooler)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Unnormalized attention score for one window vector.
    pub fn score(&self, window: &[f32]) -> f32 {
        let hidden = self
            .w1
            .chunks_exact(self.dimensions)
            .zip(&self.b1)
            .map(|(row, b)| (row.iter().zip(window).map(|(w, x)| w * x).sum::<f32>() + b).tanh());

        hidden.zip(&self.w2).map(|(h, w)| h * w).sum::<f32>() + self.b2
    }

    /// Softmax weights over the windows, summing to 1.
    pub fn weights(&self, windows: &[Vec<f32>]) -> Vec<f32> {
        let scores: Vec<f32> = windows.iter().map(|w| self.score(w)).collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    /// Pool unit-norm window vectors into one unit-norm vector.
    pub fn pool(&self, windows: &[Vec<f32>]) -> Result<Vec<f32>, EmbeddingError> {
        if windows.is_empty() {
            return Err(EmbeddingError::EmbeddingFailed("No windows to pool".to_string()));
        }
        if let Some(bad) = windows.iter().find(|w| w.len() != self.dimensions) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }

        let weights = self.weights(windows);
        let mut pooled = vec![0.0f32; self.dimensions];
        for (window, weight) in windows.iter().zip(&weights) {
            for (acc, x) in pooled.iter_mut().zip(window) {
                *acc += weight * x;
            }
        }

        l2_normalize(&mut pooled)?;
        Ok(pooled)
    }

    /// Feed the weights into a fingerprint hasher.
    pub fn fingerprint(&self, hasher: &mut Sha256) {
        hasher.update((self.dimensions as u64).to_le_bytes());
        hasher.update((self.hidden as u64).to_le_bytes());
        for value in self.w1.iter().chain(&self.b1).chain(&self.w2) {
            hasher.update(value.to_le_bytes());
        }
        hasher.update(self.b2.to_le_bytes());
    }
}
