//! Transport adapters
//!
//! Three delivery mechanisms behind one interface: the real-time WebSocket
//! channel, the HTTP request/response channel and the MQTT publish/subscribe
//! channel. Adapters never retry internally and never queue internally; every
//! failure is reported up so the delivery queue and the circuit breaker stay
//! the single source of truth.

pub mod http;
pub mod pubsub;
pub mod realtime;

pub use http::HttpTransport;
pub use pubsub::{PubSubDriver, PubSubTransport};
pub use realtime::RealtimeTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use plategate_core::{DeliveryError, Envelope};

/// Transport identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportId {
    /// Persistent bidirectional WebSocket channel
    Realtime,
    /// HTTP request/response channel
    Http,
    /// MQTT publish/subscribe channel
    PubSub,
}

impl TransportId {
    /// Fallback priority order, best link first
    pub const FALLBACK_ORDER: [TransportId; 3] =
        [TransportId::Realtime, TransportId::Http, TransportId::PubSub];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportId::Realtime => "realtime",
            TransportId::Http => "http",
            TransportId::PubSub => "pubsub",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "realtime" => Some(TransportId::Realtime),
            "http" => Some(TransportId::Http),
            "pubsub" => Some(TransportId::PubSub),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Acknowledgment from the central ingestion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Acknowledged envelope
    pub envelope_id: Uuid,

    /// The server had already seen this id; harmless, expected under retry
    pub duplicate: bool,
}

/// A failed delivery attempt.
///
/// When the server acknowledged receiving part or all of the payload before
/// the failure (a persist error after a complete upload, for instance), the
/// confirmed byte count rides along so the queue can schedule a resumed
/// retry instead of a whole-payload resend.
#[derive(Debug)]
pub struct SendFailure {
    pub error: DeliveryError,
    /// Bytes of the encoded payload the server confirmed receiving
    pub confirmed_bytes: Option<u64>,
}

impl SendFailure {
    pub fn with_progress(error: DeliveryError, confirmed_bytes: Option<u64>) -> Self {
        Self {
            error,
            confirmed_bytes,
        }
    }
}

impl From<DeliveryError> for SendFailure {
    fn from(error: DeliveryError) -> Self {
        Self {
            error,
            confirmed_bytes: None,
        }
    }
}

impl From<serde_json::Error> for SendFailure {
    fn from(e: serde_json::Error) -> Self {
        DeliveryError::from(e).into()
    }
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// Result of one delivery attempt
pub type SendResult = std::result::Result<Ack, SendFailure>;

/// Common adapter interface.
///
/// `send` may suspend up to the caller-enforced per-attempt timeout; a
/// timeout is a failure, never success-pending. `resume_from` is a byte
/// offset into the encoded payload for resumable large transfers; adapters
/// that cannot resume ignore it and send the whole envelope.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is
    fn id(&self) -> TransportId;

    /// Attempt delivery of one envelope
    async fn send(&self, envelope: &Envelope, resume_from: u64) -> SendResult;

    /// Lightweight liveness check used by the connectivity monitor
    async fn health_probe(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_order() {
        assert_eq!(TransportId::FALLBACK_ORDER[0], TransportId::Realtime);
        assert_eq!(TransportId::FALLBACK_ORDER[2], TransportId::PubSub);
    }

    #[test]
    fn test_parse_roundtrip() {
        for id in TransportId::FALLBACK_ORDER {
            assert_eq!(TransportId::parse(id.as_str()), Some(id));
        }
        assert_eq!(TransportId::parse("carrier-pigeon"), None);
    }
}
