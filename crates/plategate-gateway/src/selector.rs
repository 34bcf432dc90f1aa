//! Protocol selection
//!
//! Threshold-based, re-evaluated on every delivery attempt: the same envelope
//! may ride different transports across retries. Open breakers are excluded
//! outright; among the remaining transports the connectivity score picks the
//! band (high score → real-time, mid → request/response, low → pub/sub), and
//! an Open preferred transport falls through to the next-lower band.

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::config::MonitorSettings;
use crate::monitor::ConnectivityMonitor;
use crate::transport::TransportId;

/// Picks the transport for the next delivery attempt
pub struct ProtocolSelector {
    monitor: Arc<ConnectivityMonitor>,
    breaker: Arc<CircuitBreaker>,
    realtime_threshold: f64,
    http_threshold: f64,
}

impl ProtocolSelector {
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        breaker: Arc<CircuitBreaker>,
        settings: &MonitorSettings,
    ) -> Self {
        Self {
            monitor,
            breaker,
            realtime_threshold: settings.realtime_threshold,
            http_threshold: settings.http_threshold,
        }
    }

    /// Select and claim a transport for one attempt.
    ///
    /// Returns `None` when every transport is excluded by its breaker; the
    /// caller leaves the record Pending until connectivity improves. On
    /// `Some`, any half-open trial slot involved has been claimed and the
    /// caller must follow through with exactly one attempt.
    pub fn select(&self) -> Option<TransportId> {
        let candidates: Vec<TransportId> = TransportId::FALLBACK_ORDER
            .into_iter()
            .filter(|id| self.breaker.can_attempt(*id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Link quality estimate: the best score any usable transport reports
        let link_score = candidates
            .iter()
            .map(|id| self.monitor.score(*id))
            .fold(0.0f64, f64::max);

        let band = if link_score >= self.realtime_threshold {
            0
        } else if link_score >= self.http_threshold {
            1
        } else {
            2
        };

        // Preferred band first, then fall through to lower bands; if the
        // whole tail is excluded, take any remaining transport above the
        // band rather than stalling a deliverable envelope.
        let order = TransportId::FALLBACK_ORDER;
        let falling = order[band..].iter().chain(order[..band].iter().rev());
        for id in falling {
            if candidates.contains(id) && self.breaker.acquire(*id) {
                tracing::debug!(transport = %id, score = link_score, "transport selected");
                return Some(*id);
            }
        }
        None
    }
}
