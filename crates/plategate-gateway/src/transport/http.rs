//! Request/response transport adapter
//!
//! One HTTP POST per envelope. Idempotent by construction: resending the same
//! envelope id is safe because central ingestion dedups. Non-2xx responses
//! are failures with the status captured for the record's `last_error`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use plategate_core::{codec, DeliveryError, Envelope, EnvelopeKind, Result};

use super::{Ack, SendFailure, SendResult, Transport, TransportId};

/// Header carrying the resume byte offset for large payload retries
pub const OFFSET_HEADER: &str = "x-payload-offset";

/// Header carrying the envelope id, so ingest can dedup before decoding
pub const ENVELOPE_ID_HEADER: &str = "x-envelope-id";

/// Header on failure responses carrying the byte count the server received
pub const RECEIVED_BYTES_HEADER: &str = "x-received-bytes";

#[derive(Debug, Deserialize)]
struct AckResponse {
    #[serde(default)]
    status: String,
}

/// HTTP channel to central ingestion
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        attempt_timeout: Duration,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| DeliveryError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            api_key,
        })
    }

    fn path_for(kind: EnvelopeKind) -> &'static str {
        match kind {
            EnvelopeKind::Detection => "/api/detection",
            EnvelopeKind::Health => "/api/health",
            EnvelopeKind::Config | EnvelopeKind::Control => "/api/envelope",
        }
    }

    fn classify_status(status: StatusCode, body: String) -> DeliveryError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DeliveryError::AuthFailure(format!("{}: {}", status, body))
            }
            s if s.is_client_error() => {
                DeliveryError::Rejected(format!("{}: {}", status, body))
            }
            s => DeliveryError::TransportUnavailable(format!("{}: {}", s, body)),
        }
    }

    fn request_error(e: reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::Timeout(e.to_string())
        } else {
            DeliveryError::TransportUnavailable(e.to_string())
        }
    }

    /// Register the camera with central ingestion
    pub async fn register(&self, device_id: &str, checkpoint_id: &str) -> Result<()> {
        let mut req = self
            .client
            .post(format!("{}/api/cameras/register", self.base_url))
            .json(&serde_json::json!({
                "device_id": device_id,
                "checkpoint_id": checkpoint_id,
            }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(Self::request_error)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Self::classify_status(status, body))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn id(&self) -> TransportId {
        TransportId::Http
    }

    async fn send(&self, envelope: &Envelope, resume_from: u64) -> SendResult {
        let url = format!("{}{}", self.base_url, Self::path_for(envelope.kind));
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header(ENVELOPE_ID_HEADER, envelope.id.to_string())
            .body(codec::encode(envelope));
        if resume_from > 0 {
            req = req.header(OFFSET_HEADER, resume_from);
        }
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(Self::request_error)?;
        let status = resp.status();
        if !status.is_success() {
            // The server echoes how much it received; a retry of a large
            // payload resumes from there
            let confirmed = resp
                .headers()
                .get(RECEIVED_BYTES_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(SendFailure::with_progress(
                Self::classify_status(status, body),
                confirmed,
            ));
        }

        let ack: AckResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::AckTimeout(format!("unreadable ack body: {}", e)))?;
        Ok(Ack {
            envelope_id: envelope.id,
            duplicate: ack.status == "duplicate",
        })
    }

    async fn health_probe(&self) -> bool {
        let url = format!("{}/api/test", self.base_url);
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
