//! Wire codec for the canonical envelope
//!
//! Transport-agnostic: the bytes produced by [`encode`] are what every
//! adapter puts on the wire and what central ingestion decodes. Decoding
//! validates the payload against its declared kind exactly once; downstream
//! code never touches raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::{
    ControlPayload, DetectionPayload, Envelope, EnvelopeKind, EnvelopePayload,
};
use crate::DEFAULT_MAX_ATTEMPTS;

/// Codec failure; both variants are non-retryable and lead straight to
/// dead-lettering on the gateway side or rejection on the ingest side.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unsupported envelope kind: {0}")]
    UnsupportedKind(String),
}

/// Wire-level envelope shape shared by all transports
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    id: Uuid,
    device_id: String,
    checkpoint_id: String,
    timestamp: DateTime<Utc>,
    kind: String,
    priority: u8,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    payload: serde_json::Value,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Encode an envelope to its canonical wire bytes
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let wire = WireEnvelope {
        id: envelope.id,
        device_id: envelope.device_id.clone(),
        checkpoint_id: envelope.checkpoint_id.clone(),
        timestamp: envelope.created_at,
        kind: envelope.kind.to_string(),
        priority: envelope.priority,
        max_attempts: envelope.max_attempts,
        payload: envelope.payload.to_value(),
    };
    // WireEnvelope contains no non-serializable types
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Decode canonical wire bytes back into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;

    let kind = parse_kind(&wire.kind)?;
    let payload = parse_payload(kind, wire.payload)?;

    if wire.device_id.is_empty() {
        return Err(CodecError::MalformedEnvelope(
            "device_id cannot be empty".to_string(),
        ));
    }

    Ok(Envelope {
        id: wire.id,
        device_id: wire.device_id,
        checkpoint_id: wire.checkpoint_id,
        created_at: wire.timestamp,
        kind,
        priority: wire.priority,
        payload,
        max_attempts: wire.max_attempts,
    })
}

fn parse_kind(kind: &str) -> Result<EnvelopeKind, CodecError> {
    match kind {
        "detection" => Ok(EnvelopeKind::Detection),
        "health" => Ok(EnvelopeKind::Health),
        "config" => Ok(EnvelopeKind::Config),
        "control" => Ok(EnvelopeKind::Control),
        other => Err(CodecError::UnsupportedKind(other.to_string())),
    }
}

fn parse_payload(
    kind: EnvelopeKind,
    value: serde_json::Value,
) -> Result<EnvelopePayload, CodecError> {
    match kind {
        EnvelopeKind::Detection => {
            let payload: DetectionPayload = serde_json::from_value(value)
                .map_err(|e| CodecError::MalformedEnvelope(format!("detection payload: {}", e)))?;
            if !(0.0..=1.0).contains(&payload.confidence) {
                return Err(CodecError::MalformedEnvelope(format!(
                    "confidence out of range: {}",
                    payload.confidence
                )));
            }
            Ok(EnvelopePayload::Detection(payload))
        }
        EnvelopeKind::Health => Ok(EnvelopePayload::Health(value)),
        EnvelopeKind::Config => Ok(EnvelopePayload::Config(value)),
        EnvelopeKind::Control => {
            let payload: ControlPayload = serde_json::from_value(value)
                .map_err(|e| CodecError::MalformedEnvelope(format!("control payload: {}", e)))?;
            Ok(EnvelopePayload::Control(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            "cam-01",
            "cp-north",
            EnvelopePayload::Detection(DetectionPayload {
                plate: "XY987ZW".to_string(),
                confidence: 0.88,
                lane: None,
                captured_at: None,
                image: None,
            }),
        )
    }

    #[test]
    fn test_roundtrip_preserves_identity() {
        let env = sample();
        let decoded = decode(&encode(&env)).unwrap();
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.kind, env.kind);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut value: serde_json::Value = serde_json::from_slice(&encode(&sample())).unwrap();
        value["kind"] = serde_json::json!("firmware");
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedKind(k) if k == "firmware"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_payload_validated_against_kind() {
        let mut value: serde_json::Value = serde_json::from_slice(&encode(&sample())).unwrap();
        value["payload"] = serde_json::json!({"plate": "AB123CD"}); // missing confidence
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_confidence_range_enforced() {
        let mut value: serde_json::Value = serde_json::from_slice(&encode(&sample())).unwrap();
        value["payload"]["confidence"] = serde_json::json!(1.4);
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_missing_max_attempts_defaults() {
        let mut value: serde_json::Value = serde_json::from_slice(&encode(&sample())).unwrap();
        value.as_object_mut().unwrap().remove("max_attempts");
        let decoded = decode(value.to_string().as_bytes()).unwrap();
        assert_eq!(decoded.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }
}
