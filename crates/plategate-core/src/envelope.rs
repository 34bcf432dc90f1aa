//! The canonical message envelope
//!
//! An [`Envelope`] is immutable once created: its `id` never changes across
//! retries or transport switches, and the payload is never mutated after
//! creation. Scheduling state (attempt counts, backoff timestamps) lives in
//! the gateway's delivery queue, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DEFAULT_MAX_ATTEMPTS;

/// Message kind carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Vehicle/plate detection event
    Detection,
    /// Device health status
    Health,
    /// Configuration payload
    Config,
    /// Control command
    Control,
}

impl EnvelopeKind {
    /// Default priority band for this kind (0 = highest)
    pub fn default_priority(&self) -> u8 {
        match self {
            EnvelopeKind::Control => 0,
            EnvelopeKind::Detection => 1,
            EnvelopeKind::Config => 2,
            EnvelopeKind::Health => 3,
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Detection => write!(f, "detection"),
            EnvelopeKind::Health => write!(f, "health"),
            EnvelopeKind::Config => write!(f, "config"),
            EnvelopeKind::Control => write!(f, "control"),
        }
    }
}

/// Inline image capture attached to a detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME content type of the encoded image
    pub content_type: String,

    /// Base64-encoded image bytes
    pub data: String,
}

/// Payload of a detection envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    /// Recognized plate text, normalized upstream
    pub plate: String,

    /// Recognition confidence in [0,1]
    pub confidence: f64,

    /// Lane number at the checkpoint, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<u32>,

    /// Capture timestamp, if it differs from envelope creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,

    /// Optional inline image capture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
}

/// Payload of a control envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    /// Command name
    pub command: String,

    /// Command arguments
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Kind-tagged envelope payload, validated once at decode time
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    Detection(DetectionPayload),
    Health(serde_json::Value),
    Config(serde_json::Value),
    Control(ControlPayload),
}

impl EnvelopePayload {
    /// The kind this payload belongs to
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopePayload::Detection(_) => EnvelopeKind::Detection,
            EnvelopePayload::Health(_) => EnvelopeKind::Health,
            EnvelopePayload::Config(_) => EnvelopeKind::Config,
            EnvelopePayload::Control(_) => EnvelopeKind::Control,
        }
    }

    /// Serialize the payload to its wire JSON value
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            EnvelopePayload::Detection(p) => {
                serde_json::to_value(p).unwrap_or(serde_json::Value::Null)
            }
            EnvelopePayload::Health(v) | EnvelopePayload::Config(v) => v.clone(),
            EnvelopePayload::Control(p) => {
                serde_json::to_value(p).unwrap_or(serde_json::Value::Null)
            }
        }
    }
}

/// The canonical unit of transmissible data
///
/// Created once by a producer, then handed to the delivery queue. The `id`
/// is used for acknowledgment correlation and server-side dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique identifier, stable across retries
    pub id: Uuid,

    /// Originating device
    pub device_id: String,

    /// Checkpoint the device is installed at
    pub checkpoint_id: String,

    /// Creation timestamp (UTC)
    pub created_at: DateTime<Utc>,

    /// Message kind
    pub kind: EnvelopeKind,

    /// Priority band, 0 = highest
    pub priority: u8,

    /// Kind-tagged payload
    pub payload: EnvelopePayload,

    /// Retry budget before the envelope is dead-lettered
    pub max_attempts: u32,
}

impl Envelope {
    /// Create a new envelope; kind and default priority derive from the payload
    pub fn new(
        device_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        payload: EnvelopePayload,
    ) -> Self {
        let kind = payload.kind();
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            checkpoint_id: checkpoint_id.into(),
            created_at: Utc::now(),
            kind,
            priority: kind.default_priority(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the priority band
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Override the retry budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Size in bytes of the encoded payload, used for resumable transfer
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.payload.to_value())
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }
}
