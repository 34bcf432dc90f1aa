//! Envelope acknowledgment records
//!
//! Every accepted envelope leaves an `AckRecord` keyed by envelope id. A
//! redelivery, whatever transport it arrives on, matches the record and gets
//! a success acknowledgment without re-persisting. Records are retained
//! longer than any gateway's maximum retry span, so a duplicate can never
//! outlive its record.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Proof that an envelope was accepted
#[derive(Debug, Clone)]
pub struct AckRecord {
    pub envelope_id: Uuid,
    pub received_at: DateTime<Utc>,
    /// Transport the first delivery arrived on
    pub transport: String,
}

/// Acknowledgment store with time-based retention
pub struct AckStore {
    inner: RwLock<HashMap<Uuid, AckRecord>>,
    retention: Duration,
}

impl AckStore {
    pub fn new(retention_secs: u64) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            retention: Duration::seconds(retention_secs as i64),
        }
    }

    /// Record an acceptance, or report that one already exists.
    ///
    /// Returns `true` when the envelope was already acknowledged. The
    /// original record is kept; a duplicate never refreshes retention.
    pub fn check_and_record(&self, envelope_id: Uuid, transport: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(&envelope_id) {
            return true;
        }
        inner.insert(
            envelope_id,
            AckRecord {
                envelope_id,
                received_at: Utc::now(),
                transport: transport.to_string(),
            },
        );
        false
    }

    /// Release a claim. Only valid when the claimed envelope was never
    /// persisted, so its retry must read as a first delivery.
    pub fn remove(&self, envelope_id: Uuid) -> bool {
        self.inner.write().remove(&envelope_id).is_some()
    }

    pub fn get(&self, envelope_id: Uuid) -> Option<AckRecord> {
        self.inner.read().get(&envelope_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop records older than the retention window
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|_, record| record.received_at >= cutoff);
        before - inner.len()
    }
}
