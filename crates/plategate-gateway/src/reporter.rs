//! Health reporting
//!
//! Periodically assembles the gateway's own operating stats (queue depth,
//! dead-letter backlog, breaker states, per-transport connectivity), logs
//! them for the local operator, and enqueues them as a health envelope so
//! central ingestion (and the dashboard behind it) sees them too.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use plategate_core::{DeliveryError, Envelope, EnvelopePayload, Result};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::monitor::{ConnectivityMonitor, HealthSnapshot};
use crate::queue::{DeliveryQueue, QueueStats};

/// Dead-lettered record summary surfaced to operators
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterSummary {
    pub id: Uuid,
    pub kind: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// One periodic self-report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub device_id: String,
    pub checkpoint_id: String,
    pub at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub queue: QueueStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub transports: Vec<HealthSnapshot>,
    pub recent_dead_letters: Vec<DeadLetterSummary>,
}

/// Periodic self-reporting worker
pub struct HealthReporter {
    device_id: String,
    checkpoint_id: String,
    queue: Arc<DeliveryQueue>,
    monitor: Arc<ConnectivityMonitor>,
    breaker: Arc<CircuitBreaker>,
    interval: Duration,
    started: Instant,
}

impl HealthReporter {
    pub fn new(
        device_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        queue: Arc<DeliveryQueue>,
        monitor: Arc<ConnectivityMonitor>,
        breaker: Arc<CircuitBreaker>,
        interval: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            checkpoint_id: checkpoint_id.into(),
            queue,
            monitor,
            breaker,
            interval,
            started: Instant::now(),
        }
    }

    /// Assemble the current report
    pub fn report(&self) -> Result<HealthReport> {
        let dead_letters = self
            .queue
            .recent_dead_letters(10)?
            .into_iter()
            .map(|r| DeadLetterSummary {
                id: r.envelope.id,
                kind: r.envelope.kind.to_string(),
                attempts: r.attempt_count,
                last_error: r.last_error,
            })
            .collect();

        Ok(HealthReport {
            device_id: self.device_id.clone(),
            checkpoint_id: self.checkpoint_id.clone(),
            at: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            queue: self.queue.stats()?,
            breakers: self.breaker.snapshot(),
            transports: self.monitor.snapshot(),
            recent_dead_letters: dead_letters,
        })
    }

    /// Emit reports until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.report() {
                Ok(report) => {
                    tracing::info!(
                        pending = report.queue.pending,
                        in_flight = report.queue.in_flight,
                        dead_lettered = report.queue.dead_lettered,
                        open_breakers = report
                            .breakers
                            .iter()
                            .filter(|b| b.state != crate::breaker::BreakerState::Closed)
                            .count(),
                        "health report"
                    );
                    if let Err(e) = self.enqueue_report(&report) {
                        tracing::debug!(error = %e, "health report not enqueued");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to assemble health report"),
            }

            // Retention housekeeping rides the report tick
            match self.queue.purge_expired() {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "expired records purged"),
                Err(e) => tracing::warn!(error = %e, "retention purge failed"),
            }
        }
        tracing::debug!("health reporter stopped");
    }

    fn enqueue_report(&self, report: &HealthReport) -> Result<()> {
        let envelope = Envelope::new(
            &self.device_id,
            &self.checkpoint_id,
            EnvelopePayload::Health(serde_json::to_value(report)?),
        );
        match self.queue.enqueue(&envelope) {
            Ok(()) => Ok(()),
            // Health self-reports yield under backpressure
            Err(DeliveryError::QueueFull(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerSettings, MonitorSettings, QueueSettings, RetrySettings};
    use crate::queue::AttemptOutcome;
    use crate::transport::TransportId;
    use plategate_core::{DetectionPayload, EnvelopeKind};

    fn reporter() -> HealthReporter {
        let queue = Arc::new(
            DeliveryQueue::in_memory(QueueSettings::default(), RetrySettings::default()).unwrap(),
        );
        HealthReporter::new(
            "cam-01",
            "cp-north",
            queue,
            Arc::new(ConnectivityMonitor::new(MonitorSettings::default())),
            Arc::new(CircuitBreaker::new(BreakerSettings::default())),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_report_covers_all_transports() {
        let r = reporter();
        let report = r.report().unwrap();
        assert_eq!(report.transports.len(), 3);
        assert_eq!(report.breakers.len(), 3);
    }

    #[test]
    fn test_dead_letters_surfaced() {
        let r = reporter();
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
        r.queue.enqueue(&envelope).unwrap();
        let rec = r.queue.dequeue_next_ready().unwrap().unwrap();
        r.queue
            .mark_attempted(
                &rec,
                TransportId::Http,
                AttemptOutcome::Failed {
                    error: DeliveryError::Rejected("bad".into()),
                    bytes_sent: None,
                },
            )
            .unwrap();

        let report = r.report().unwrap();
        assert_eq!(report.recent_dead_letters.len(), 1);
        assert_eq!(report.recent_dead_letters[0].id, envelope.id);
    }

    #[test]
    fn test_report_enqueues_as_health_envelope() {
        let r = reporter();
        let report = r.report().unwrap();
        r.enqueue_report(&report).unwrap();
        let rec = r.queue.dequeue_next_ready().unwrap().unwrap();
        assert_eq!(rec.envelope.kind, EnvelopeKind::Health);
    }
}
