//! Delivery error taxonomy
//!
//! Shared by the gateway and the ingestion service so that retryability is
//! classified in exactly one place.

use thiserror::Error;

use crate::codec::CodecError;

/// Result type alias for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors produced while moving an envelope from edge to center
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Connection or socket-level failure; retryable
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Per-attempt timeout elapsed; retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Authentication rejected by the remote side; surfaced to the operator
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Structural envelope failure; dead-lettered immediately
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The delivery queue refused the envelope; backpressure to the producer
    #[error("Queue full for priority band {0}")]
    QueueFull(u8),

    /// The send completed but no acknowledgment arrived in time. The remote
    /// side may still have received the envelope; server-side dedup makes the
    /// resulting duplicate harmless.
    #[error("Acknowledgment timeout: {0}")]
    AckTimeout(String),

    /// Remote rejected the envelope as invalid; non-retryable
    #[error("Rejected by ingestion: {0}")]
    Rejected(String),

    /// Queue storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(e: serde_json::Error) -> Self {
        DeliveryError::Serialization(e.to_string())
    }
}

impl DeliveryError {
    /// Whether a failed attempt should be rescheduled with backoff.
    ///
    /// Non-retryable errors dead-letter the record immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::TransportUnavailable(_)
                | DeliveryError::Timeout(_)
                | DeliveryError::AckTimeout(_)
                | DeliveryError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failures_retryable() {
        assert!(DeliveryError::TransportUnavailable("refused".into()).is_retryable());
        assert!(DeliveryError::Timeout("send".into()).is_retryable());
        assert!(DeliveryError::AckTimeout("no ack".into()).is_retryable());
    }

    #[test]
    fn test_structural_failures_not_retryable() {
        let codec = DeliveryError::Codec(CodecError::UnsupportedKind("x".into()));
        assert!(!codec.is_retryable());
        assert!(!DeliveryError::AuthFailure("bad key".into()).is_retryable());
        assert!(!DeliveryError::Rejected("schema".into()).is_retryable());
        assert!(!DeliveryError::QueueFull(3).is_retryable());
    }
}
