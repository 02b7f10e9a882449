use crate::config::ConfigError;
use crate::models::EmbeddingError;
use crate::store::ann::IndexError;
use crate::store::StorageError;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("product {0} not found")]
    NotFound(u64),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("catalog is inconsistent: {0}")]
    Consistency(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl CatalogError {
    pub fn validation(message: impl Into<String>) -> Self {
        CatalogError::Validation {
            errors: vec![message.into()],
        }
    }
}
