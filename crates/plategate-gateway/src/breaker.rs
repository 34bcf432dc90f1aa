//! Per-transport circuit breaker
//!
//! Each of the three transports carries an independent state machine:
//!
//! - **Closed**: attempts flow normally; N consecutive failures inside the
//!   sliding window trip the breaker to Open.
//! - **Open**: the selector excludes the transport; after the cool-down it
//!   becomes eligible for a single half-open trial.
//! - **HalfOpen**: exactly one trial attempt; success closes the breaker,
//!   failure reopens it with the cool-down doubled, capped.
//!
//! The breaker governs the transport; retry/backoff on individual envelopes
//! is the delivery queue's business.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::BreakerSettings;
use crate::transport::TransportId;

/// Breaker state machine value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct TransportBreaker {
    state: BreakerState,
    /// Timestamps of consecutive failures inside the sliding window
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    cooldown: Duration,
    trial_in_flight: bool,
    last_transition: DateTime<Utc>,
}

impl TransportBreaker {
    fn new(settings: &BreakerSettings) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            cooldown: Duration::from_secs(settings.cooldown_secs),
            trial_in_flight: false,
            last_transition: Utc::now(),
        }
    }

    fn transition(&mut self, to: BreakerState, now: DateTime<Utc>) {
        self.state = to;
        self.last_transition = now;
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(at) => {
                now - at >= ChronoDuration::from_std(self.cooldown).unwrap_or(ChronoDuration::zero())
            }
            None => true,
        }
    }
}

/// Read-only breaker view for the selector and reporter
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub transport: TransportId,
    pub state: BreakerState,
    pub recent_failures: usize,
    pub cooldown_secs: u64,
    pub last_transition: DateTime<Utc>,
}

/// Circuit breaker / fallback controller. Sole mutator of breaker state.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: RwLock<HashMap<TransportId, TransportBreaker>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let mut inner = HashMap::new();
        for id in TransportId::FALLBACK_ORDER {
            inner.insert(id, TransportBreaker::new(&settings));
        }
        Self {
            settings,
            inner: RwLock::new(inner),
        }
    }

    /// Whether the transport could accept an attempt right now, without
    /// claiming a half-open trial slot. Used for candidate filtering.
    pub fn can_attempt(&self, id: TransportId) -> bool {
        let now = Utc::now();
        let inner = self.inner.read();
        match inner.get(&id) {
            Some(b) => match b.state {
                BreakerState::Closed => true,
                BreakerState::Open => b.cooldown_elapsed(now),
                BreakerState::HalfOpen => !b.trial_in_flight,
            },
            None => false,
        }
    }

    /// Claim the right to dispatch one attempt on the transport.
    ///
    /// An Open breaker whose cool-down has elapsed transitions to HalfOpen
    /// here, and the single trial slot is taken. Returns `false` when the
    /// transport must not be attempted.
    pub fn acquire(&self, id: TransportId) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(b) = inner.get_mut(&id) else {
            return false;
        };
        match b.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if b.cooldown_elapsed(now) {
                    b.transition(BreakerState::HalfOpen, now);
                    b.trial_in_flight = true;
                    tracing::info!(transport = %id, "breaker half-open, dispatching trial");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if b.trial_in_flight {
                    false
                } else {
                    b.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Release an acquired trial slot without an attempt having run, e.g.
    /// when dispatch failed during shutdown.
    pub fn abort_trial(&self, id: TransportId) {
        let mut inner = self.inner.write();
        if let Some(b) = inner.get_mut(&id) {
            if b.state == BreakerState::HalfOpen {
                b.trial_in_flight = false;
            }
        }
    }

    /// Record a successful attempt
    pub fn record_success(&self, id: TransportId) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(b) = inner.get_mut(&id) else { return };
        b.failures.clear();
        b.trial_in_flight = false;
        if b.state != BreakerState::Closed {
            b.transition(BreakerState::Closed, now);
            b.cooldown = Duration::from_secs(self.settings.cooldown_secs);
            b.opened_at = None;
            tracing::info!(transport = %id, "breaker closed");
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self, id: TransportId) {
        let now = Utc::now();
        let window = ChronoDuration::seconds(self.settings.window_secs as i64);
        let mut inner = self.inner.write();
        let Some(b) = inner.get_mut(&id) else { return };

        match b.state {
            BreakerState::Closed => {
                b.failures.push_back(now);
                while let Some(front) = b.failures.front() {
                    if now - *front > window {
                        b.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if b.failures.len() >= self.settings.failure_threshold as usize {
                    b.transition(BreakerState::Open, now);
                    b.opened_at = Some(now);
                    b.failures.clear();
                    tracing::warn!(
                        transport = %id,
                        cooldown_secs = b.cooldown.as_secs(),
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Trial failed; reopen with the cool-down doubled, capped
                b.trial_in_flight = false;
                b.cooldown = (b.cooldown * 2)
                    .min(Duration::from_secs(self.settings.cooldown_max_secs));
                b.transition(BreakerState::Open, now);
                b.opened_at = Some(now);
                tracing::warn!(
                    transport = %id,
                    cooldown_secs = b.cooldown.as_secs(),
                    "half-open trial failed, breaker reopened"
                );
            }
            BreakerState::Open => {
                // Late failure from an attempt dispatched before the trip
            }
        }
    }

    /// Current state of one transport
    pub fn state(&self, id: TransportId) -> BreakerState {
        self.inner
            .read()
            .get(&id)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of all breakers for the reporter
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let inner = self.inner.read();
        TransportId::FALLBACK_ORDER
            .iter()
            .filter_map(|id| {
                inner.get(id).map(|b| BreakerSnapshot {
                    transport: *id,
                    state: b.state,
                    recent_failures: b.failures.len(),
                    cooldown_secs: b.cooldown.as_secs(),
                    last_transition: b.last_transition,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with(cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs,
            cooldown_max_secs: 600,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker_with(30);
        for _ in 0..4 {
            breaker.record_failure(TransportId::Realtime);
        }
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::Closed);
        breaker.record_failure(TransportId::Realtime);
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::Open);
        assert!(!breaker.can_attempt(TransportId::Realtime));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = breaker_with(30);
        for _ in 0..4 {
            breaker.record_failure(TransportId::Http);
        }
        breaker.record_success(TransportId::Http);
        for _ in 0..4 {
            breaker.record_failure(TransportId::Http);
        }
        assert_eq!(breaker.state(TransportId::Http), BreakerState::Closed);
    }

    #[test]
    fn test_single_half_open_trial() {
        let breaker = breaker_with(0); // immediate half-open eligibility
        for _ in 0..5 {
            breaker.record_failure(TransportId::Realtime);
        }
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::Open);

        // Cool-down of zero: first acquire takes the trial slot
        assert!(breaker.acquire(TransportId::Realtime));
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::HalfOpen);

        // No second trial while the first is in flight
        assert!(!breaker.acquire(TransportId::Realtime));

        breaker.record_success(TransportId::Realtime);
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::Closed);
    }

    #[test]
    fn test_failed_trial_doubles_cooldown() {
        let breaker = breaker_with(0);
        for _ in 0..5 {
            breaker.record_failure(TransportId::PubSub);
        }
        assert!(breaker.acquire(TransportId::PubSub));
        breaker.record_failure(TransportId::PubSub);
        assert_eq!(breaker.state(TransportId::PubSub), BreakerState::Open);

        let snap = breaker.snapshot();
        let pubsub = snap
            .iter()
            .find(|s| s.transport == TransportId::PubSub)
            .unwrap();
        // 0 * 2 stays 0 here; verify via a nonzero base instead
        assert!(pubsub.cooldown_secs <= 600);

        let breaker = breaker_with(30);
        for _ in 0..5 {
            breaker.record_failure(TransportId::PubSub);
        }
        {
            // Force cool-down elapsed
            let mut inner = breaker.inner.write();
            inner.get_mut(&TransportId::PubSub).unwrap().opened_at =
                Some(Utc::now() - ChronoDuration::seconds(120));
        }
        assert!(breaker.acquire(TransportId::PubSub));
        breaker.record_failure(TransportId::PubSub);
        let snap = breaker.snapshot();
        let pubsub = snap
            .iter()
            .find(|s| s.transport == TransportId::PubSub)
            .unwrap();
        assert_eq!(pubsub.cooldown_secs, 60);
    }

    #[test]
    fn test_cooldown_growth_is_capped() {
        let breaker = breaker_with(400);
        for _ in 0..5 {
            breaker.record_failure(TransportId::Http);
        }
        for _ in 0..3 {
            let mut inner = breaker.inner.write();
            let b = inner.get_mut(&TransportId::Http).unwrap();
            b.opened_at = Some(Utc::now() - ChronoDuration::seconds(10_000));
            drop(inner);
            assert!(breaker.acquire(TransportId::Http));
            breaker.record_failure(TransportId::Http);
        }
        let snap = breaker.snapshot();
        let http = snap
            .iter()
            .find(|s| s.transport == TransportId::Http)
            .unwrap();
        assert_eq!(http.cooldown_secs, 600);
    }

    #[test]
    fn test_breakers_are_independent() {
        let breaker = breaker_with(30);
        for _ in 0..5 {
            breaker.record_failure(TransportId::Realtime);
        }
        assert_eq!(breaker.state(TransportId::Realtime), BreakerState::Open);
        assert_eq!(breaker.state(TransportId::Http), BreakerState::Closed);
        assert_eq!(breaker.state(TransportId::PubSub), BreakerState::Closed);
    }
}
