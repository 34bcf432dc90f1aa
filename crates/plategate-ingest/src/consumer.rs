//! Pub/sub consumer
//!
//! Subscribes to the detection and health topics under the gateway namespace
//! and feeds received payloads through the same acceptance path as the HTTP
//! and WebSocket surfaces. The config and control topics are not consumed:
//! on the pub/sub channel those carry the center-to-device direction.
//!
//! The session is persistent, so envelopes published while this service was
//! down are delivered by the broker on reconnect.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::server::{ingest, IngestState};

/// Device and kind parsed off a gateway topic
#[derive(Debug, PartialEq, Eq)]
struct TopicParts<'a> {
    device_id: &'a str,
    kind: &'a str,
}

/// Parse `{namespace}/cameras/{device}/{kind}`
fn parse_topic<'a>(namespace: &str, topic: &'a str) -> Option<TopicParts<'a>> {
    let rest = topic.strip_prefix(namespace)?.strip_prefix("/cameras/")?;
    let (device_id, kind) = rest.split_once('/')?;
    if device_id.is_empty() || kind.is_empty() || kind.contains('/') {
        return None;
    }
    Some(TopicParts { device_id, kind })
}

/// Run the consumer until cancelled, reconnecting with backoff
pub async fn run_consumer(
    state: Arc<IngestState>,
    host: String,
    port: u16,
    namespace: String,
    cancel: CancellationToken,
) {
    let mut retry = Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_session(&state, &host, port, &namespace, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(error = %e, retry_in_secs = retry.as_secs(), "pub/sub consumer session lost");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
                retry = (retry * 2).min(Duration::from_secs(30));
            }
        }
    }
    tracing::info!("pub/sub consumer stopped");
}

/// One broker session; returns `Ok` only on cancellation
async fn run_session(
    state: &IngestState,
    host: &str,
    port: u16,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut options = MqttOptions::new("plategate-ingest", host, port);
    options.set_keep_alive(Duration::from_secs(30));
    // Persistent session: the broker queues QoS>0 envelopes while we are down
    options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(options, 100);

    let topics = [
        format!("{}/cameras/+/detection", namespace),
        format!("{}/cameras/+/health", namespace),
    ];
    for topic in &topics {
        client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| IngestError::Consumer(format!("subscribe {}: {}", topic, e)))?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(host, port, "connected to pub/sub broker");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_message(state, namespace, &publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(IngestError::Consumer(e.to_string()));
                }
            }
        }
    }
}

async fn handle_message(state: &IngestState, namespace: &str, topic: &str, payload: &[u8]) {
    let Some(parts) = parse_topic(namespace, topic) else {
        tracing::warn!(topic, "unparseable topic, skipping message");
        return;
    };

    tracing::debug!(
        device = parts.device_id,
        kind = parts.kind,
        payload_size = payload.len(),
        "pub/sub delivery"
    );

    // Dedup makes QoS 1 redelivery harmless; rejects are logged and dropped,
    // the channel has no reply path
    match ingest(state, payload, "pubsub").await {
        crate::server::IngestOutcome::Accepted { .. } => {}
        crate::server::IngestOutcome::Rejected { reason } => {
            tracing::warn!(device = parts.device_id, topic, reason, "rejected pub/sub envelope");
        }
        crate::server::IngestOutcome::Failed { reason } => {
            tracing::error!(device = parts.device_id, topic, reason, "failed to persist pub/sub envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::AckStore;
    use crate::store::EnvelopeStore;
    use crate::watchlist::WatchList;
    use plategate_core::{codec, DetectionPayload, Envelope, EnvelopePayload};

    #[test]
    fn test_parse_topic() {
        let parts = parse_topic("plategate", "plategate/cameras/cam-01/detection").unwrap();
        assert_eq!(parts.device_id, "cam-01");
        assert_eq!(parts.kind, "detection");
    }

    #[test]
    fn test_parse_topic_rejects_foreign_shapes() {
        assert!(parse_topic("plategate", "other/cameras/cam-01/detection").is_none());
        assert!(parse_topic("plategate", "plategate/cameras/cam-01").is_none());
        assert!(parse_topic("plategate", "plategate/cameras//detection").is_none());
        assert!(parse_topic("plategate", "plategate/cameras/cam-01/detection/extra").is_none());
    }

    #[tokio::test]
    async fn test_handle_message_feeds_ingest() {
        let state = IngestState::new(
            AckStore::new(3600),
            WatchList::new([]),
            EnvelopeStore::discard(),
            None,
        );
        let envelope = Envelope::new(
            "cam-01",
            "cp-north",
            EnvelopePayload::Detection(DetectionPayload {
                plate: "AB123CD".to_string(),
                confidence: 0.9,
                lane: None,
                captured_at: None,
                image: None,
            }),
        );

        handle_message(
            &state,
            "plategate",
            "plategate/cameras/cam-01/detection",
            &codec::encode(&envelope),
        )
        .await;

        assert_eq!(state.dedup.len(), 1);
        assert!(state.dedup.get(envelope.id).is_some());
    }

    #[tokio::test]
    async fn test_handle_message_skips_foreign_topic() {
        let state = IngestState::new(
            AckStore::new(3600),
            WatchList::new([]),
            EnvelopeStore::discard(),
            None,
        );
        handle_message(&state, "plategate", "weird/topic", b"{}").await;
        assert!(state.dedup.is_empty());
    }
}
