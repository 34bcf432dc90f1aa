//! Connectivity monitoring
//!
//! The [`ConnectivityMonitor`] owns per-transport [`TransportHealth`] rolling
//! statistics, fed from two sources: passive observation of every adapter
//! attempt and active probing of idle transports. It is the only component
//! that mutates health state; the selector and reporter read snapshots.
//!
//! The connectivity score is a weighted combination of recent success ratio,
//! normalized latency and recency of last success. The weighting is tunable
//! configuration, but the score is always monotonic: higher loss or higher
//! latency never increases it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorSettings;
use crate::transport::{Transport, TransportId};

/// Outcome of a single delivery attempt or probe
#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    at: DateTime<Utc>,
    success: bool,
}

/// Per-transport rolling statistics
#[derive(Debug, Clone)]
pub struct TransportHealth {
    /// Total successful attempts
    pub success_count: u64,

    /// Total failed attempts
    pub failure_count: u64,

    /// Exponentially weighted mean attempt latency, ms
    pub mean_latency_ms: f64,

    /// Timestamp of the most recent success
    pub last_success: Option<DateTime<Utc>>,

    /// Timestamp of the most recent attempt of any outcome
    pub last_attempt: Option<DateTime<Utc>>,

    /// Bounded window of recent outcomes
    window: VecDeque<AttemptRecord>,
    window_cap: usize,
}

impl TransportHealth {
    fn new(window_cap: usize) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            mean_latency_ms: 0.0,
            last_success: None,
            last_attempt: None,
            window: VecDeque::with_capacity(window_cap),
            window_cap,
        }
    }

    fn push(&mut self, record: AttemptRecord) {
        if self.window.len() == self.window_cap {
            self.window.pop_front();
        }
        self.window.push_back(record);
        self.last_attempt = Some(record.at);
    }

    fn record_success(&mut self, latency: Duration, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success = Some(now);
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.mean_latency_ms = if self.success_count == 1 {
            latency_ms
        } else {
            // EWMA, alpha 0.3
            self.mean_latency_ms * 0.7 + latency_ms * 0.3
        };
        self.push(AttemptRecord { at: now, success: true });
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.push(AttemptRecord { at: now, success: false });
    }

    /// Fraction of recent attempts that succeeded; 1.0 with no history so a
    /// freshly started gateway prefers the real-time channel until proven
    /// otherwise.
    pub fn success_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|r| r.success).count();
        ok as f64 / self.window.len() as f64
    }

    /// Connectivity score in [0,1]
    pub fn score(&self, settings: &MonitorSettings, now: DateTime<Utc>) -> f64 {
        let success = self.success_ratio();

        let latency = if self.success_count == 0 {
            1.0
        } else {
            (1.0 - self.mean_latency_ms / settings.latency_norm_ms).clamp(0.0, 1.0)
        };

        let recency = match self.last_success {
            None if self.failure_count == 0 => 1.0, // no evidence either way
            None => 0.0,
            Some(at) => {
                let age = (now - at).num_milliseconds() as f64 / 1000.0;
                (1.0 - age / settings.recency_horizon_secs).clamp(0.0, 1.0)
            }
        };

        (settings.weight_success * success
            + settings.weight_latency * latency
            + settings.weight_recency * recency)
            .clamp(0.0, 1.0)
    }
}

/// Read-only health view handed to the selector and reporter
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub transport: TransportId,
    pub success_count: u64,
    pub failure_count: u64,
    pub mean_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub score: f64,
}

/// Owns all per-transport health state
pub struct ConnectivityMonitor {
    settings: MonitorSettings,
    health: RwLock<HashMap<TransportId, TransportHealth>>,
}

impl ConnectivityMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let mut health = HashMap::new();
        for id in TransportId::FALLBACK_ORDER {
            health.insert(id, TransportHealth::new(settings.window));
        }
        Self {
            settings,
            health: RwLock::new(health),
        }
    }

    /// Record a successful attempt with its observed latency
    pub fn record_success(&self, id: TransportId, latency: Duration) {
        let now = Utc::now();
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&id) {
            h.record_success(latency, now);
        }
        tracing::debug!(transport = %id, latency_ms = latency.as_millis() as u64, "attempt succeeded");
    }

    /// Record a failed attempt
    pub fn record_failure(&self, id: TransportId) {
        let now = Utc::now();
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&id) {
            h.record_failure(now);
        }
        tracing::debug!(transport = %id, "attempt failed");
    }

    /// Current connectivity score for a transport
    pub fn score(&self, id: TransportId) -> f64 {
        let health = self.health.read();
        health
            .get(&id)
            .map(|h| h.score(&self.settings, Utc::now()))
            .unwrap_or(0.0)
    }

    /// Timestamp of the last attempt on a transport, if any
    pub fn last_attempt(&self, id: TransportId) -> Option<DateTime<Utc>> {
        self.health.read().get(&id).and_then(|h| h.last_attempt)
    }

    /// Snapshot of all transports for the reporter
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let now = Utc::now();
        let health = self.health.read();
        TransportId::FALLBACK_ORDER
            .iter()
            .filter_map(|id| {
                health.get(id).map(|h| HealthSnapshot {
                    transport: *id,
                    success_count: h.success_count,
                    failure_count: h.failure_count,
                    mean_latency_ms: h.mean_latency_ms,
                    last_success: h.last_success,
                    score: h.score(&self.settings, now),
                })
            })
            .collect()
    }

    /// Drive active probing of idle transports until cancelled.
    ///
    /// A transport is probed only when no attempt touched it within the probe
    /// interval, so busy transports are measured passively and idle ones do
    /// not go stale.
    pub async fn run_prober(
        self: Arc<Self>,
        transports: Vec<Arc<dyn Transport>>,
        cancel: CancellationToken,
    ) {
        let interval = Duration::from_secs(self.settings.probe_interval_secs);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            for transport in &transports {
                let id = transport.id();
                let idle = match self.last_attempt(id) {
                    Some(at) => Utc::now() - at >= chrono::Duration::from_std(interval).unwrap_or_default(),
                    None => true,
                };
                if !idle {
                    continue;
                }

                let started = std::time::Instant::now();
                let alive = tokio::time::timeout(interval, transport.health_probe())
                    .await
                    .unwrap_or(false);
                if alive {
                    self.record_success(id, started.elapsed());
                } else {
                    self.record_failure(id);
                    tracing::warn!(transport = %id, "liveness probe failed");
                }
            }
        }
        tracing::debug!("connectivity prober stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MonitorSettings {
        MonitorSettings::default()
    }

    #[test]
    fn test_fresh_transport_scores_high() {
        let monitor = ConnectivityMonitor::new(settings());
        let score = monitor.score(TransportId::Realtime);
        assert!(score >= settings().realtime_threshold);
    }

    #[test]
    fn test_failures_lower_score() {
        let monitor = ConnectivityMonitor::new(settings());
        let before = monitor.score(TransportId::Realtime);
        for _ in 0..10 {
            monitor.record_failure(TransportId::Realtime);
        }
        let after = monitor.score(TransportId::Realtime);
        assert!(after < before);
        assert!(after < 0.5);
    }

    #[test]
    fn test_score_monotonic_in_latency() {
        let s = settings();
        let now = Utc::now();

        let mut fast = TransportHealth::new(s.window);
        fast.record_success(Duration::from_millis(50), now);

        let mut slow = TransportHealth::new(s.window);
        slow.record_success(Duration::from_millis(1900), now);

        assert!(fast.score(&s, now) > slow.score(&s, now));
    }

    #[test]
    fn test_success_recovers_score() {
        let monitor = ConnectivityMonitor::new(settings());
        for _ in 0..10 {
            monitor.record_failure(TransportId::Http);
        }
        let degraded = monitor.score(TransportId::Http);
        for _ in 0..20 {
            monitor.record_success(TransportId::Http, Duration::from_millis(80));
        }
        assert!(monitor.score(TransportId::Http) > degraded);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut s = settings();
        s.window = 5;
        let monitor = ConnectivityMonitor::new(s);
        for _ in 0..100 {
            monitor.record_failure(TransportId::PubSub);
        }
        for _ in 0..5 {
            monitor.record_success(TransportId::PubSub, Duration::from_millis(10));
        }
        // Window holds only the 5 most recent outcomes, all successes
        let snapshot = monitor.snapshot();
        let pubsub = snapshot
            .iter()
            .find(|h| h.transport == TransportId::PubSub)
            .unwrap();
        assert_eq!(pubsub.failure_count, 100);
        assert!(pubsub.score > 0.5);
    }
}
