//! Real-time transport adapter
//!
//! Persistent bidirectional WebSocket channel. Supports server-initiated
//! acknowledgments and live push of control envelopes back to the device.
//! While disconnected, `send` fails fast; the delivery queue is the single
//! source of queuing truth, so no frames are buffered here. A background
//! reconnect loop re-establishes the session with backoff.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use plategate_core::{codec, DeliveryError, Envelope, EnvelopeKind, Result};

use super::{Ack, SendFailure, SendResult, Transport, TransportId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side event frame
#[derive(Debug, Serialize)]
struct ClientEvent {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<serde_json::Value>,
    /// Byte offset for resumable large-payload retries
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

/// Server-side event frame
#[derive(Debug, Deserialize)]
struct ServerEvent {
    event: String,
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    envelope: Option<serde_json::Value>,
    /// Bytes the server confirmed receiving before a failed acceptance
    #[serde(default)]
    received: Option<u64>,
}

/// Persistent WebSocket channel to central ingestion
pub struct RealtimeTransport {
    url: String,
    device_id: String,
    checkpoint_id: String,
    ack_timeout: Duration,
    conn: Mutex<Option<WsStream>>,
    control_tx: Option<mpsc::Sender<Envelope>>,
}

impl RealtimeTransport {
    pub fn new(
        url: impl Into<String>,
        device_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            checkpoint_id: checkpoint_id.into(),
            ack_timeout,
            conn: Mutex::new(None),
            control_tx: None,
        }
    }

    /// Forward server-pushed control envelopes to this sink
    pub fn with_control_sink(mut self, tx: mpsc::Sender<Envelope>) -> Self {
        self.control_tx = Some(tx);
        self
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Establish the session and register the camera
    pub async fn connect(&self) -> Result<()> {
        let (mut ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| DeliveryError::TransportUnavailable(e.to_string()))?;

        let register = ClientEvent {
            event: "camera_register",
            device_id: Some(self.device_id.clone()),
            checkpoint_id: Some(self.checkpoint_id.clone()),
            envelope: None,
            offset: None,
        };
        ws.send(Message::Text(serde_json::to_string(&register)?))
            .await
            .map_err(|e| DeliveryError::TransportUnavailable(e.to_string()))?;

        // Wait for the register ack before the channel is considered live
        let ack = tokio::time::timeout(self.ack_timeout, ws.next())
            .await
            .map_err(|_| DeliveryError::AckTimeout("camera_register".to_string()))?;
        match ack {
            Some(Ok(Message::Text(text))) => {
                let event: ServerEvent = serde_json::from_str(&text)?;
                if event.event != "camera_register" || event.status.as_deref() == Some("error") {
                    return Err(DeliveryError::AuthFailure(
                        event.message.unwrap_or_else(|| "registration rejected".to_string()),
                    ));
                }
            }
            _ => {
                return Err(DeliveryError::TransportUnavailable(
                    "connection closed during registration".to_string(),
                ))
            }
        }

        *self.conn.lock().await = Some(ws);
        tracing::info!(url = %self.url, "real-time channel connected");
        Ok(())
    }

    async fn drop_connection(&self) {
        *self.conn.lock().await = None;
    }

    /// Reconnect with bounded exponential backoff until cancelled
    pub async fn run_reconnect(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = Duration::from_secs(1);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.is_connected().await {
                delay = Duration::from_secs(1);
                continue;
            }
            match self.connect().await {
                Ok(()) => delay = Duration::from_secs(1),
                Err(e) => {
                    tracing::debug!(error = %e, retry_in_secs = delay.as_secs() * 2, "reconnect failed");
                    delay = (delay * 2).min(Duration::from_secs(60));
                }
            }
        }
        tracing::debug!("real-time reconnect loop stopped");
    }

    fn event_name(kind: EnvelopeKind) -> &'static str {
        match kind {
            EnvelopeKind::Detection => "lpr_data",
            EnvelopeKind::Health => "health_status",
            EnvelopeKind::Config | EnvelopeKind::Control => "envelope",
        }
    }

    fn response_for(&self, envelope_id: Uuid, event: ServerEvent) -> Option<SendResult> {
        match event.event.as_str() {
            "lpr_response" | "health_response" | "envelope_response" | "error"
                if event.id == Some(envelope_id) =>
            {
                match event.status.as_deref() {
                    Some("ok") => Some(Ok(Ack {
                        envelope_id,
                        duplicate: false,
                    })),
                    Some("duplicate") => Some(Ok(Ack {
                        envelope_id,
                        duplicate: true,
                    })),
                    // The server received the payload but could not persist
                    // it; retryable, resuming from the confirmed offset
                    Some("failed") => Some(Err(SendFailure::with_progress(
                        DeliveryError::TransportUnavailable(
                            event
                                .message
                                .unwrap_or_else(|| "ingest persistence failed".to_string()),
                        ),
                        event.received,
                    ))),
                    _ => Some(Err(DeliveryError::Rejected(
                        event.message.unwrap_or_else(|| "rejected".to_string()),
                    )
                    .into())),
                }
            }
            "control" => {
                // Server-initiated push riding the same connection
                if let (Some(tx), Some(value)) = (&self.control_tx, event.envelope) {
                    if let Ok(bytes) = serde_json::to_vec(&value) {
                        match codec::decode(&bytes) {
                            Ok(env) => {
                                let _ = tx.try_send(env);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed control push")
                            }
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Handle one frame read while probing. Control pushes are routed to the
    /// control sink instead of being discarded; any parseable frame counts
    /// as liveness evidence.
    fn probe_frame(&self, text: &str) -> bool {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                if event.event != "pong" {
                    let _ = self.response_for(Uuid::nil(), event);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable server frame during probe");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for RealtimeTransport {
    fn id(&self) -> TransportId {
        TransportId::Realtime
    }

    async fn send(&self, envelope: &Envelope, resume_from: u64) -> SendResult {
        let mut guard = self.conn.lock().await;
        let ws = guard.as_mut().ok_or_else(|| {
            SendFailure::from(DeliveryError::TransportUnavailable(
                "real-time channel disconnected".to_string(),
            ))
        })?;

        let wire: serde_json::Value = serde_json::from_slice(&codec::encode(envelope))?;
        let frame = ClientEvent {
            event: Self::event_name(envelope.kind),
            device_id: None,
            checkpoint_id: None,
            envelope: Some(wire),
            offset: (resume_from > 0).then_some(resume_from),
        };

        if let Err(e) = ws.send(Message::Text(serde_json::to_string(&frame)?)).await {
            *guard = None;
            return Err(DeliveryError::TransportUnavailable(e.to_string()).into());
        }

        // Read frames until our acknowledgment arrives or the timeout fires;
        // unrelated control pushes are forwarded along the way.
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => {
                    return Err(DeliveryError::AckTimeout(format!(
                        "no acknowledgment for {} within {:?}",
                        envelope.id, self.ack_timeout
                    ))
                    .into())
                }
                Ok(None) => {
                    *guard = None;
                    return Err(DeliveryError::TransportUnavailable(
                        "connection closed awaiting acknowledgment".to_string(),
                    )
                    .into());
                }
                Ok(Some(Err(e))) => {
                    *guard = None;
                    return Err(DeliveryError::TransportUnavailable(e.to_string()).into());
                }
                Ok(Some(Ok(frame))) => frame,
            };

            if let Message::Text(text) = frame {
                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable server frame");
                        continue;
                    }
                };
                if let Some(outcome) = self.response_for(envelope.id, event) {
                    return outcome;
                }
            }
        }
    }

    async fn health_probe(&self) -> bool {
        // A disconnected channel probes by attempting to connect
        if !self.is_connected().await {
            return self.connect().await.is_ok();
        }

        let mut guard = self.conn.lock().await;
        let Some(ws) = guard.as_mut() else {
            return false;
        };
        let ping = ClientEvent {
            event: "ping",
            device_id: None,
            checkpoint_id: None,
            envelope: None,
            offset: None,
        };
        let Ok(text) = serde_json::to_string(&ping) else {
            return false;
        };
        if ws.send(Message::Text(text)).await.is_err() {
            *guard = None;
            return false;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if self.probe_frame(&text) {
                        return true;
                    }
                }
                Ok(Some(Ok(_))) => continue,
                _ => {
                    *guard = None;
                    return false;
                }
            }
        }
    }
}
