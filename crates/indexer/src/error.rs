use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Transcript error: {0}")]
    Transcript(#[from] refork_transcript::TranscriptError),

    #[error("Vector store error: {0}")]
    VectorStore(#[from] refork_vector_store::VectorStoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] refork_registry::RegistryError),

    #[error("Timed out after {seconds:.0}s indexing {path}")]
    Timeout { path: PathBuf, seconds: f64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Timeouts are tracked separately from failures in setup state.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
