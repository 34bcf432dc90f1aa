//! Publish/subscribe transport adapter
//!
//! MQTT channel of last resort for degraded links. Topics are namespaced by
//! device and message kind; delivery assurance follows the kind: detections
//! need acknowledged delivery, health is fire-and-forget, config/control use
//! exactly-once semantics and are retained so a reconnecting device
//! immediately receives the last known desired state.
//!
//! The session is persistent (clean_session = false), so control
//! subscriptions survive a brief disconnect and queued commands are not lost.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use plategate_core::{codec, DeliveryError, Envelope, EnvelopeKind};

use super::{Ack, SendResult, Transport, TransportId};

/// MQTT channel to central ingestion
pub struct PubSubTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    namespace: String,
    device_id: String,
}

/// Owns the MQTT event loop; must be spawned for the transport to function
pub struct PubSubDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<String>,
    control_tx: Option<mpsc::Sender<Envelope>>,
}

impl PubSubTransport {
    /// Build the transport and its event loop driver
    pub fn new(
        host: impl Into<String>,
        port: u16,
        namespace: impl Into<String>,
        device_id: impl Into<String>,
        control_tx: Option<mpsc::Sender<Envelope>>,
    ) -> (Self, PubSubDriver) {
        let namespace = namespace.into();
        let device_id = device_id.into();

        let mut options = MqttOptions::new(format!("plategate-{}", device_id), host.into(), port);
        options.set_keep_alive(Duration::from_secs(30));
        // Persistent session: the broker keeps our subscriptions and queued
        // QoS>0 messages while we are offline
        options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));

        let subscriptions = vec![
            format!("{}/cameras/{}/control", namespace, device_id),
            format!("{}/cameras/{}/config", namespace, device_id),
        ];

        let transport = Self {
            client: client.clone(),
            connected: connected.clone(),
            namespace,
            device_id,
        };
        let driver = PubSubDriver {
            client,
            eventloop,
            connected,
            subscriptions,
            control_tx,
        };
        (transport, driver)
    }

    fn topic_for(&self, kind: EnvelopeKind) -> String {
        format!("{}/cameras/{}/{}", self.namespace, self.device_id, kind)
    }

    fn qos_for(kind: EnvelopeKind) -> QoS {
        match kind {
            EnvelopeKind::Detection => QoS::AtLeastOnce,
            EnvelopeKind::Health => QoS::AtMostOnce,
            EnvelopeKind::Config | EnvelopeKind::Control => QoS::ExactlyOnce,
        }
    }

    fn retain_for(kind: EnvelopeKind) -> bool {
        matches!(kind, EnvelopeKind::Config | EnvelopeKind::Control)
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn id(&self) -> TransportId {
        TransportId::PubSub
    }

    async fn send(&self, envelope: &Envelope, _resume_from: u64) -> SendResult {
        // Fail fast while the broker session is down; the delivery queue owns
        // all buffering
        if !self.connected.load(Ordering::Acquire) {
            return Err(DeliveryError::TransportUnavailable(
                "broker session down".to_string(),
            )
            .into());
        }

        let topic = self.topic_for(envelope.kind);
        let qos = Self::qos_for(envelope.kind);
        self.client
            .publish(topic, qos, Self::retain_for(envelope.kind), codec::encode(envelope))
            .await
            .map_err(|e| DeliveryError::TransportUnavailable(e.to_string()))?;

        // QoS retransmission within the persistent session carries the
        // delivery assurance from here; a publish accepted while connected is
        // the channel's acknowledgment
        Ok(Ack {
            envelope_id: envelope.id,
            duplicate: false,
        })
    }

    async fn health_probe(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl PubSubDriver {
    /// Drive the MQTT event loop until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut retry = Duration::from_secs(1);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::Release);
                        retry = Duration::from_secs(1);
                        tracing::info!("pub/sub channel connected");
                        // Re-issue subscriptions; with a persistent session
                        // this is a no-op server-side but heals brokers that
                        // expired the session
                        for topic in &self.subscriptions {
                            if let Err(e) = self
                                .client
                                .subscribe(topic.clone(), QoS::ExactlyOnce)
                                .await
                            {
                                tracing::warn!(topic = %topic, error = %e, "subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_inbound(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.connected.swap(false, Ordering::AcqRel) {
                            tracing::warn!(error = %e, "pub/sub channel lost");
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(retry) => {}
                        }
                        retry = (retry * 2).min(Duration::from_secs(30));
                    }
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        tracing::debug!("pub/sub driver stopped");
    }

    fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        let Some(tx) = &self.control_tx else { return };
        match codec::decode(payload) {
            Ok(envelope) => {
                tracing::debug!(topic = %topic, id = %envelope.id, "inbound command");
                let _ = tx.try_send(envelope);
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "dropping malformed inbound message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plategate_core::{DetectionPayload, EnvelopePayload};

    fn transport() -> (PubSubTransport, PubSubDriver) {
        PubSubTransport::new("127.0.0.1", 1883, "plategate", "cam-01", None)
    }

    #[test]
    fn test_topic_namespacing() {
        let (t, _driver) = transport();
        assert_eq!(
            t.topic_for(EnvelopeKind::Detection),
            "plategate/cameras/cam-01/detection"
        );
        assert_eq!(
            t.topic_for(EnvelopeKind::Control),
            "plategate/cameras/cam-01/control"
        );
    }

    #[test]
    fn test_delivery_assurance_by_kind() {
        assert_eq!(PubSubTransport::qos_for(EnvelopeKind::Detection), QoS::AtLeastOnce);
        assert_eq!(PubSubTransport::qos_for(EnvelopeKind::Health), QoS::AtMostOnce);
        assert_eq!(PubSubTransport::qos_for(EnvelopeKind::Config), QoS::ExactlyOnce);
        assert_eq!(PubSubTransport::qos_for(EnvelopeKind::Control), QoS::ExactlyOnce);
    }

    #[test]
    fn test_config_and_control_are_retained() {
        assert!(PubSubTransport::retain_for(EnvelopeKind::Config));
        assert!(PubSubTransport::retain_for(EnvelopeKind::Control));
        assert!(!PubSubTransport::retain_for(EnvelopeKind::Detection));
        assert!(!PubSubTransport::retain_for(EnvelopeKind::Health));
    }

    #[test]
    fn test_control_and_config_topics_subscribed() {
        let (_t, driver) = transport();
        assert!(driver
            .subscriptions
            .contains(&"plategate/cameras/cam-01/control".to_string()));
        assert!(driver
            .subscriptions
            .contains(&"plategate/cameras/cam-01/config".to_string()));
    }

    #[tokio::test]
    async fn test_send_fails_fast_while_disconnected() {
        let (t, _driver) = transport();
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
        let failure = t.send(&envelope, 0).await.unwrap_err();
        assert!(matches!(failure.error, DeliveryError::TransportUnavailable(_)));
    }
}
