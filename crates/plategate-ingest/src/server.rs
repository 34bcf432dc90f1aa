//! Ingestion surfaces
//!
//! One core acceptance path shared by every transport: decode, dedup by
//! envelope id, watch-list flag, persist, acknowledge. The HTTP routes and
//! the WebSocket session are thin adapters over [`ingest`]; the pub/sub
//! consumer in [`crate::consumer`] feeds the same function.
//!
//! Malformed input is rejected as non-retryable so the sending gateway
//! dead-letters it instead of retrying forever. A duplicate delivery gets a
//! success acknowledgment without re-persisting.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use plategate_core::{codec, Envelope, EnvelopePayload};

use crate::dedup::AckStore;
use crate::error::Result;
use crate::store::EnvelopeStore;
use crate::watchlist::WatchList;

/// Resume byte offset sent by gateways retrying large payloads
pub const OFFSET_HEADER: &str = "x-payload-offset";

/// Envelope id header, present so dedup could run before decode
pub const ENVELOPE_ID_HEADER: &str = "x-envelope-id";

/// Byte count echoed on failure responses so the gateway can resume
pub const RECEIVED_BYTES_HEADER: &str = "x-received-bytes";

/// Interval between acknowledgment retention sweeps
pub const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared ingestion state
pub struct IngestState {
    pub dedup: AckStore,
    pub watchlist: WatchList,
    pub store: EnvelopeStore,
    pub api_key: Option<String>,
    started: Instant,
}

impl IngestState {
    pub fn new(
        dedup: AckStore,
        watchlist: WatchList,
        store: EnvelopeStore,
        api_key: Option<String>,
    ) -> Self {
        Self {
            dedup,
            watchlist,
            store,
            api_key,
            started: Instant::now(),
        }
    }
}

/// Outcome of one delivery
#[derive(Debug)]
pub enum IngestOutcome {
    /// Envelope acknowledged; `duplicate` deliveries are not re-persisted
    Accepted {
        envelope_id: Uuid,
        duplicate: bool,
        watch_hit: bool,
    },
    /// Structurally invalid; the sender must not retry
    Rejected { reason: String },
    /// Persistence failed; the sender may retry
    Failed { reason: String },
}

/// Accept one envelope delivery, whatever transport it arrived on
pub async fn ingest(state: &IngestState, bytes: &[u8], transport: &str) -> IngestOutcome {
    let envelope = match codec::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(transport, error = %e, "rejecting malformed envelope");
            return IngestOutcome::Rejected {
                reason: e.to_string(),
            };
        }
    };

    // Claim the id before persisting; a concurrent redelivery sees the claim
    // and acks as duplicate
    if state.dedup.check_and_record(envelope.id, transport) {
        tracing::debug!(id = %envelope.id, transport, "duplicate delivery acknowledged");
        return IngestOutcome::Accepted {
            envelope_id: envelope.id,
            duplicate: true,
            watch_hit: false,
        };
    }

    let watch_hit = match &envelope.payload {
        EnvelopePayload::Detection(detection) => {
            let hit = state.watchlist.matches(&detection.plate);
            if hit {
                tracing::info!(
                    id = %envelope.id,
                    plate = %detection.plate,
                    device = %envelope.device_id,
                    checkpoint = %envelope.checkpoint_id,
                    "watch-list hit"
                );
            }
            hit
        }
        _ => false,
    };

    if let Err(e) = state.store.append(&envelope, transport, watch_hit).await {
        // Release the claim so the retry is not mistaken for a duplicate
        state.dedup.remove(envelope.id);
        tracing::error!(id = %envelope.id, error = %e, "failed to persist envelope");
        return IngestOutcome::Failed {
            reason: e.to_string(),
        };
    }

    tracing::debug!(
        id = %envelope.id,
        kind = %envelope.kind,
        device = %envelope.device_id,
        transport,
        "envelope accepted"
    );
    IngestOutcome::Accepted {
        envelope_id: envelope.id,
        duplicate: false,
        watch_hit,
    }
}

#[derive(Debug, Serialize)]
struct AckBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    watch_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IngestOutcome {
    fn into_response_parts(self) -> (StatusCode, AckBody) {
        match self {
            IngestOutcome::Accepted {
                envelope_id,
                duplicate,
                watch_hit,
            } => (
                StatusCode::OK,
                AckBody {
                    status: if duplicate { "duplicate" } else { "ok" },
                    id: Some(envelope_id),
                    watch_hit: Some(watch_hit),
                    message: None,
                },
            ),
            IngestOutcome::Rejected { reason } => (
                StatusCode::BAD_REQUEST,
                AckBody {
                    status: "rejected",
                    id: None,
                    watch_hit: None,
                    message: Some(reason),
                },
            ),
            IngestOutcome::Failed { reason } => (
                StatusCode::SERVICE_UNAVAILABLE,
                AckBody {
                    status: "failed",
                    id: None,
                    watch_hit: None,
                    message: Some(reason),
                },
            ),
        }
    }
}

/// Build the HTTP + WebSocket router
pub fn router(state: Arc<IngestState>) -> Router {
    Router::new()
        .route("/api/cameras/register", post(register_camera))
        .route("/api/detection", post(receive_envelope))
        .route("/api/health", post(receive_envelope))
        .route("/api/envelope", post(receive_envelope))
        .route("/api/test", get(service_status))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Periodically drop acknowledgment records past their retention window.
///
/// Runs for the lifetime of the service; without it the dedup map would
/// grow with every envelope ever accepted.
pub async fn run_dedup_purger(
    state: Arc<IngestState>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let purged = state.dedup.purge_expired();
        if purged > 0 {
            tracing::debug!(
                purged,
                remaining = state.dedup.len(),
                "expired acknowledgments purged"
            );
        }
    }
    tracing::debug!("acknowledgment purger stopped");
}

/// Serve until cancelled
pub async fn run(state: Arc<IngestState>, bind_addr: &str, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "ingestion server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!("ingestion server stopped");
    Ok(())
}

fn authorized(state: &IngestState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.api_key else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", expected))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    device_id: String,
    #[serde(default)]
    checkpoint_id: Option<String>,
}

async fn register_camera(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "status": "unauthorized" })),
        );
    }
    tracing::info!(
        device = %body.device_id,
        checkpoint = body.checkpoint_id.as_deref().unwrap_or("-"),
        "camera registered"
    );
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn receive_envelope(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            HeaderMap::new(),
            Json(AckBody {
                status: "unauthorized",
                id: None,
                watch_hit: None,
                message: None,
            }),
        );
    }

    if let Some(offset) = headers
        .get(OFFSET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        tracing::debug!(
            offset,
            id = headers
                .get(ENVELOPE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "resumed delivery"
        );
    }

    let received = body.len() as u64;
    let (status, ack) = ingest(&state, &body, "http").await.into_response_parts();

    // On a persistence failure the whole body did arrive; echo the count so
    // the gateway resumes instead of resending large payloads from zero
    let mut reply_headers = HeaderMap::new();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        reply_headers.insert(RECEIVED_BYTES_HEADER, received.into());
    }
    (status, reply_headers, Json(ack))
}

async fn service_status(State(state): State<Arc<IngestState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "plategate-ingest",
        "version": crate::VERSION,
        "uptime_secs": state.started.elapsed().as_secs(),
        "acknowledged": state.dedup.len(),
    }))
}

async fn ws_upgrade(
    State(state): State<Arc<IngestState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

/// Client frame on the real-time channel
#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    envelope: Option<serde_json::Value>,
    #[serde(default)]
    offset: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ServerFrame {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    /// Bytes received, echoed on failed acceptance for resumable retries
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<u64>,
}

fn response_event(client_event: &str) -> &'static str {
    match client_event {
        "lpr_data" => "lpr_response",
        "health_status" => "health_response",
        _ => "envelope_response",
    }
}

/// Envelope id straight off the wire value, for correlating rejects
fn wire_id(envelope: Option<&serde_json::Value>) -> Option<Uuid> {
    envelope
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

async fn ws_session(state: Arc<IngestState>, mut socket: WebSocket) {
    let mut device_id: Option<String> = None;

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let client: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let reply = ServerFrame {
                    event: "error",
                    id: None,
                    status: Some("rejected"),
                    message: Some(format!("unparseable frame: {}", e)),
                    received: None,
                };
                if send_frame(&mut socket, &reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let reply = match client.event.as_str() {
            "camera_register" => {
                device_id = client.device_id.clone();
                tracing::info!(
                    device = device_id.as_deref().unwrap_or("-"),
                    "camera session registered"
                );
                ServerFrame {
                    event: "camera_register",
                    id: None,
                    status: Some("ok"),
                    message: None,
                    received: None,
                }
            }
            "ping" => ServerFrame {
                event: "pong",
                id: None,
                status: None,
                message: None,
                received: None,
            },
            "lpr_data" | "health_status" | "envelope" => {
                if let Some(offset) = client.offset {
                    tracing::debug!(offset, "resumed delivery over ws");
                }
                let event = response_event(&client.event);
                match &client.envelope {
                    Some(value) => match serde_json::to_vec(value) {
                        Ok(bytes) => {
                            match ingest(&state, &bytes, "realtime").await {
                                IngestOutcome::Accepted {
                                    envelope_id,
                                    duplicate,
                                    ..
                                } => ServerFrame {
                                    event,
                                    id: Some(envelope_id),
                                    status: Some(if duplicate { "duplicate" } else { "ok" }),
                                    message: None,
                                    received: None,
                                },
                                IngestOutcome::Rejected { reason } => ServerFrame {
                                    event,
                                    id: wire_id(client.envelope.as_ref()),
                                    status: Some("rejected"),
                                    message: Some(reason),
                                    received: None,
                                },
                                IngestOutcome::Failed { reason } => ServerFrame {
                                    event,
                                    id: wire_id(client.envelope.as_ref()),
                                    status: Some("failed"),
                                    message: Some(reason),
                                    received: Some(bytes.len() as u64),
                                },
                            }
                        }
                        Err(e) => ServerFrame {
                            event,
                            id: None,
                            status: Some("rejected"),
                            message: Some(e.to_string()),
                            received: None,
                        },
                    },
                    None => ServerFrame {
                        event,
                        id: None,
                        status: Some("rejected"),
                        message: Some("missing envelope".to_string()),
                        received: None,
                    },
                }
            }
            other => ServerFrame {
                event: "error",
                id: None,
                status: Some("rejected"),
                message: Some(format!("unknown event: {}", other)),
                received: None,
            },
        };

        if send_frame(&mut socket, &reply).await.is_err() {
            break;
        }
    }

    tracing::debug!(
        device = device_id.as_deref().unwrap_or("-"),
        "camera session closed"
    );
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> std::result::Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server frame");
            Ok(())
        }
    }
}

/// Push a control or config envelope to a connected camera.
///
/// Used by operator tooling behind the dashboard; rides the same frame
/// vocabulary the gateway's real-time adapter understands.
pub fn control_frame(envelope: &Envelope) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(&codec::encode(envelope))?;
    Ok(serde_json::json!({ "event": "control", "envelope": value }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plategate_core::{DetectionPayload, EnvelopeKind};

    fn state() -> IngestState {
        IngestState::new(
            AckStore::new(3600),
            WatchList::new(["AB123CD".to_string()]),
            EnvelopeStore::discard(),
            None,
        )
    }

    fn detection(plate: &str) -> Envelope {
        Envelope::new(
            "cam-01",
            "cp-north",
            EnvelopePayload::Detection(DetectionPayload {
                plate: plate.to_string(),
                confidence: 0.93,
                lane: Some(1),
                captured_at: None,
                image: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_accept_then_duplicate() {
        let state = state();
        let env = detection("XY987Z");
        let bytes = codec::encode(&env);

        match ingest(&state, &bytes, "http").await {
            IngestOutcome::Accepted {
                envelope_id,
                duplicate,
                ..
            } => {
                assert_eq!(envelope_id, env.id);
                assert!(!duplicate);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }

        // Redelivery on a different transport still acks as duplicate
        match ingest(&state, &bytes, "pubsub").await {
            IngestOutcome::Accepted { duplicate, .. } => assert!(duplicate),
            other => panic!("expected duplicate ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_list_flagging() {
        let state = state();
        match ingest(&state, &codec::encode(&detection("ab-123 cd")), "http").await {
            IngestOutcome::Accepted { watch_hit, .. } => assert!(watch_hit),
            other => panic!("expected acceptance, got {:?}", other),
        }
        match ingest(&state, &codec::encode(&detection("ZZ000ZZ")), "http").await {
            IngestOutcome::Accepted { watch_hit, .. } => assert!(!watch_hit),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_bytes_rejected() {
        let state = state();
        let outcome = ingest(&state, b"{ not json", "http").await;
        assert!(matches!(outcome, IngestOutcome::Rejected { .. }));
        // Nothing acknowledged
        assert!(state.dedup.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let state = state();
        let mut value: serde_json::Value =
            serde_json::from_slice(&codec::encode(&detection("AB123CD"))).unwrap();
        value["kind"] = serde_json::json!("firmware");
        let outcome = ingest(&state, value.to_string().as_bytes(), "http").await;
        assert!(matches!(outcome, IngestOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_persisted_with_receipt_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let state = IngestState::new(
            AckStore::new(3600),
            WatchList::new([]),
            EnvelopeStore::open(dir.path()).await.unwrap(),
            None,
        );

        let env = detection("AB123CD");
        let bytes = codec::encode(&env);
        ingest(&state, &bytes, "realtime").await;
        // Duplicate must not produce a second ledger line
        ingest(&state, &bytes, "http").await;

        let entries = state.store.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transport, "realtime");
    }

    #[tokio::test]
    async fn test_expired_acknowledgment_reingests_as_new() {
        let state = Arc::new(IngestState::new(
            AckStore::new(0),
            WatchList::new([]),
            EnvelopeStore::discard(),
            None,
        ));
        let cancel = CancellationToken::new();
        let purger = tokio::spawn(run_dedup_purger(
            state.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let env = detection("XY987Z");
        let bytes = codec::encode(&env);
        match ingest(&state, &bytes, "http").await {
            IngestOutcome::Accepted { duplicate, .. } => assert!(!duplicate),
            other => panic!("expected acceptance, got {:?}", other),
        }

        // Retention is zero, so the sweep drops the record
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.dedup.is_empty());

        match ingest(&state, &bytes, "http").await {
            IngestOutcome::Accepted { duplicate, .. } => assert!(!duplicate),
            other => panic!("expected fresh acceptance, got {:?}", other),
        }

        cancel.cancel();
        purger.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_persist_releases_claim() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ledger");
        let store = EnvelopeStore::open(&base).await.unwrap();
        // Replace the ledger directory with a plain file so appends fail
        tokio::fs::remove_dir_all(&base).await.unwrap();
        tokio::fs::write(&base, b"").await.unwrap();

        let state = IngestState::new(AckStore::new(3600), WatchList::new([]), store, None);
        let outcome = ingest(&state, &codec::encode(&detection("AB123CD")), "http").await;
        assert!(matches!(outcome, IngestOutcome::Failed { .. }));
        // The retry must not read as a duplicate
        assert!(state.dedup.is_empty());
    }

    #[test]
    fn test_failed_frame_reports_received_bytes() {
        let frame = ServerFrame {
            event: "lpr_response",
            id: None,
            status: Some("failed"),
            message: Some("disk full".to_string()),
            received: Some(512),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["received"], 512);
        assert_eq!(value["status"], "failed");
    }

    #[test]
    fn test_response_event_vocabulary() {
        assert_eq!(response_event("lpr_data"), "lpr_response");
        assert_eq!(response_event("health_status"), "health_response");
        assert_eq!(response_event("envelope"), "envelope_response");
    }

    #[test]
    fn test_wire_id_extraction() {
        let env = detection("AB123CD");
        let value: serde_json::Value = serde_json::from_slice(&codec::encode(&env)).unwrap();
        assert_eq!(wire_id(Some(&value)), Some(env.id));
        assert_eq!(wire_id(Some(&serde_json::json!({ "id": "nope" }))), None);
        assert_eq!(wire_id(None), None);
    }

    #[test]
    fn test_control_frame_round_trips_through_gateway_vocabulary() {
        let env = Envelope::new(
            "cam-01",
            "cp-north",
            EnvelopePayload::Control(plategate_core::ControlPayload {
                command: "restart".to_string(),
                args: serde_json::json!({}),
            }),
        );
        let frame = control_frame(&env).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "control");
        assert_eq!(value["envelope"]["kind"], "control");
        assert_eq!(env.kind, EnvelopeKind::Control);
    }
}
