//! Ingestion error taxonomy

use thiserror::Error;

use plategate_core::CodecError;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors produced while accepting envelopes at the center
#[derive(Error, Debug)]
pub enum IngestError {
    /// Structural envelope failure; the sender gets a non-retryable reject
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Persistence failure; the sender gets a retryable failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pub/sub consumer failure
    #[error("Consumer error: {0}")]
    Consumer(String),
}
