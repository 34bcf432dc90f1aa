//! Durable, priority-ordered delivery queue
//!
//! The queue is the single source of queuing truth: adapters never buffer
//! envelopes internally. Records are persisted to SQLite (WAL) so Pending and
//! InFlight work survives a process restart; InFlight records found at
//! startup are reset to Pending.
//!
//! Ordering: ready records are served in ascending priority, ties broken by
//! creation time. Records whose pending age exceeds a configurable threshold
//! are promoted one priority band so low-priority traffic cannot starve.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use plategate_core::{codec, DeliveryError, Envelope, Result};

use crate::config::{QueueSettings, RetrySettings};
use crate::transport::TransportId;

/// Scheduling state of a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Acked,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Acked => "acked",
            DeliveryState::DeadLettered => "dead_lettered",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryState::Pending),
            "in_flight" => Some(DeliveryState::InFlight),
            "acked" => Some(DeliveryState::Acked),
            "dead_lettered" => Some(DeliveryState::DeadLettered),
            _ => None,
        }
    }
}

/// One entry in the attempted-transport history of a record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptNote {
    pub transport: TransportId,
    pub at: DateTime<Utc>,
    pub ok: bool,
}

/// An envelope wrapped with its scheduling state. Owned exclusively by the
/// queue; workers receive a copy while the row is marked InFlight.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub envelope: Envelope,
    pub state: DeliveryState,
    /// Effective priority; promotion may raise it above the envelope's own
    pub priority: u8,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub assigned_transport: Option<TransportId>,
    /// Confirmed byte offset for resumable large-payload transfer
    pub bytes_sent: u64,
    pub history: Vec<AttemptNote>,
}

impl DeliveryRecord {
    /// Byte offset a retry should resume from, or 0 for whole-payload resend
    pub fn resume_from(&self, threshold_bytes: u64) -> u64 {
        if self.envelope.payload_size() > threshold_bytes {
            self.bytes_sent
        } else {
            0
        }
    }
}

/// Outcome of one delivery attempt, reported by the worker
#[derive(Debug)]
pub enum AttemptOutcome {
    Acked { duplicate: bool },
    Failed {
        error: DeliveryError,
        /// Bytes confirmed transferred before the failure, if the adapter knows
        bytes_sent: Option<u64>,
    },
}

/// Aggregate queue counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    pub dead_lettered: u64,
}

/// Durable delivery queue
pub struct DeliveryQueue {
    conn: Mutex<Connection>,
    queue: QueueSettings,
    retry: RetrySettings,
}

fn db_err(e: rusqlite::Error) -> DeliveryError {
    DeliveryError::Storage(e.to_string())
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS delivery_records (
    id                 TEXT PRIMARY KEY,
    envelope           BLOB NOT NULL,
    state              TEXT NOT NULL,
    priority           INTEGER NOT NULL,
    created_at         INTEGER NOT NULL,
    promoted_at        INTEGER,
    next_attempt_at    INTEGER NOT NULL,
    attempt_count      INTEGER NOT NULL DEFAULT 0,
    max_attempts       INTEGER NOT NULL,
    last_error         TEXT,
    assigned_transport TEXT,
    bytes_sent         INTEGER NOT NULL DEFAULT 0,
    history            TEXT NOT NULL DEFAULT '[]',
    finished_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_records_ready
    ON delivery_records (state, priority, created_at);
";

impl DeliveryQueue {
    /// Open (or create) a queue at the given path. InFlight records left over
    /// from a previous run are reset to Pending.
    pub fn open(path: &Path, queue: QueueSettings, retry: RetrySettings) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        Self::init(conn, queue, retry)
    }

    /// In-memory queue, for tests and ephemeral deployments
    pub fn in_memory(queue: QueueSettings, retry: RetrySettings) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, queue, retry)
    }

    fn init(conn: Connection, queue: QueueSettings, retry: RetrySettings) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        let recovered = conn
            .execute(
                "UPDATE delivery_records
                 SET state = 'pending', next_attempt_at = ?1
                 WHERE state = 'in_flight'",
                params![ms(Utc::now())],
            )
            .map_err(db_err)?;
        if recovered > 0 {
            tracing::info!(recovered, "reset in-flight records to pending after restart");
        }
        Ok(Self {
            conn: Mutex::new(conn),
            queue,
            retry,
        })
    }

    /// Add an envelope to the queue.
    ///
    /// Backpressure: if the envelope's priority band is at its depth cap, the
    /// lowest-priority pending record is evicted to DeadLettered to make room
    /// for more important traffic; if the incoming envelope is itself the
    /// least important, `QueueFull` is returned to the producer.
    pub fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        let conn = self.conn.lock();
        let now = Utc::now();

        let band_depth: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM delivery_records
                 WHERE state IN ('pending', 'in_flight') AND priority = ?1",
                params![envelope.priority as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        if band_depth >= self.queue.max_depth_per_band as i64 {
            let victim: Option<(String, i64)> = conn
                .query_row(
                    "SELECT id, priority FROM delivery_records
                     WHERE state = 'pending'
                     ORDER BY priority DESC, created_at DESC
                     LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;

            match victim {
                Some((victim_id, victim_priority))
                    if victim_priority > envelope.priority as i64 =>
                {
                    conn.execute(
                        "UPDATE delivery_records
                         SET state = 'dead_lettered',
                             last_error = 'evicted: queue full',
                             finished_at = ?2
                         WHERE id = ?1",
                        params![victim_id, ms(now)],
                    )
                    .map_err(db_err)?;
                    tracing::warn!(
                        evicted = %victim_id,
                        priority = victim_priority,
                        "evicted lowest-priority record to dead-letter under backpressure"
                    );
                }
                _ => return Err(DeliveryError::QueueFull(envelope.priority)),
            }
        }

        conn.execute(
            "INSERT INTO delivery_records
                 (id, envelope, state, priority, created_at, next_attempt_at, max_attempts)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
            params![
                envelope.id.to_string(),
                codec::encode(envelope),
                envelope.priority as i64,
                ms(envelope.created_at),
                ms(now),
                envelope.max_attempts as i64,
            ],
        )
        .map_err(db_err)?;

        tracing::debug!(id = %envelope.id, kind = %envelope.kind, priority = envelope.priority, "enqueued");
        Ok(())
    }

    /// Take the next ready record, marking it InFlight. Mutual exclusion per
    /// record: a record handed out here is never handed out again until
    /// released or marked.
    pub fn dequeue_next_ready(&self) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock();
        let now = Utc::now();

        // Starvation guard: promote records whose pending age exceeds the
        // threshold one band toward 0.
        conn.execute(
            "UPDATE delivery_records
             SET priority = priority - 1, promoted_at = ?1
             WHERE state = 'pending' AND priority > 0
               AND COALESCE(promoted_at, created_at) <= ?2",
            params![ms(now), ms(now) - self.queue.age_promotion_secs * 1000],
        )
        .map_err(db_err)?;

        let record = conn
            .query_row(
                "SELECT id, envelope, state, priority, attempt_count, next_attempt_at,
                        last_error, assigned_transport, bytes_sent, history
                 FROM delivery_records
                 WHERE state = 'pending' AND next_attempt_at <= ?1
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1",
                params![ms(now)],
                Self::row_to_record,
            )
            .optional()
            .map_err(db_err)?;

        let Some(mut record) = record else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE delivery_records SET state = 'in_flight' WHERE id = ?1",
            params![record.envelope.id.to_string()],
        )
        .map_err(db_err)?;
        record.state = DeliveryState::InFlight;

        Ok(Some(record))
    }

    /// Put an InFlight record back to Pending without counting an attempt,
    /// e.g. when no transport is currently selectable.
    pub fn release(&self, id: Uuid, delay: std::time::Duration) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE delivery_records
             SET state = 'pending', next_attempt_at = ?2
             WHERE id = ?1 AND state = 'in_flight'",
            params![id.to_string(), ms(Utc::now()) + delay.as_millis() as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record the outcome of a delivery attempt and return the record's new
    /// state.
    pub fn mark_attempted(
        &self,
        record: &DeliveryRecord,
        transport: TransportId,
        outcome: AttemptOutcome,
    ) -> Result<DeliveryState> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let id = record.envelope.id.to_string();
        let attempts = record.attempt_count + 1;

        let mut history = record.history.clone();
        history.push(AttemptNote {
            transport,
            at: now,
            ok: matches!(outcome, AttemptOutcome::Acked { .. }),
        });
        let history_json = serde_json::to_string(&history)?;

        let new_state = match outcome {
            AttemptOutcome::Acked { duplicate } => {
                conn.execute(
                    "UPDATE delivery_records
                     SET state = 'acked', attempt_count = ?2, assigned_transport = ?3,
                         history = ?4, finished_at = ?5, last_error = NULL
                     WHERE id = ?1",
                    params![id, attempts as i64, transport.as_str(), history_json, ms(now)],
                )
                .map_err(db_err)?;
                tracing::info!(id = %record.envelope.id, transport = %transport, duplicate, attempts, "acked");
                DeliveryState::Acked
            }
            AttemptOutcome::Failed { error, bytes_sent } => {
                let confirmed = bytes_sent
                    .map(|b| b.max(record.bytes_sent))
                    .unwrap_or(record.bytes_sent);
                let exhausted = attempts >= record.envelope.max_attempts;
                if !error.is_retryable() || exhausted {
                    conn.execute(
                        "UPDATE delivery_records
                         SET state = 'dead_lettered', attempt_count = ?2,
                             assigned_transport = ?3, last_error = ?4, history = ?5,
                             bytes_sent = ?6, finished_at = ?7
                         WHERE id = ?1",
                        params![
                            id,
                            attempts as i64,
                            transport.as_str(),
                            error.to_string(),
                            history_json,
                            confirmed as i64,
                            ms(now),
                        ],
                    )
                    .map_err(db_err)?;
                    tracing::warn!(
                        id = %record.envelope.id,
                        transport = %transport,
                        attempts,
                        error = %error,
                        reason = if exhausted { "retry budget exhausted" } else { "non-retryable" },
                        "dead-lettered"
                    );
                    DeliveryState::DeadLettered
                } else {
                    let delay = self.backoff(attempts);
                    conn.execute(
                        "UPDATE delivery_records
                         SET state = 'pending', attempt_count = ?2, assigned_transport = ?3,
                             last_error = ?4, history = ?5, bytes_sent = ?6,
                             next_attempt_at = ?7
                         WHERE id = ?1",
                        params![
                            id,
                            attempts as i64,
                            transport.as_str(),
                            error.to_string(),
                            history_json,
                            confirmed as i64,
                            ms(now) + delay as i64,
                        ],
                    )
                    .map_err(db_err)?;
                    tracing::debug!(
                        id = %record.envelope.id,
                        transport = %transport,
                        attempts,
                        retry_in_ms = delay,
                        error = %error,
                        "retry scheduled"
                    );
                    DeliveryState::Pending
                }
            }
        };

        Ok(new_state)
    }

    /// Exponential backoff with jitter, capped:
    /// `base * 2^(attempts-1) * (1 ± jitter)`, at most `max_ms`.
    fn backoff(&self, attempts: u32) -> u64 {
        let exp = (attempts.saturating_sub(1)).min(20);
        let raw = self.retry.base_ms as f64 * 2f64.powi(exp as i32);
        let jitter = if self.retry.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.retry.jitter..=self.retry.jitter)
        } else {
            1.0
        };
        ((raw * jitter) as u64).min(self.retry.max_ms)
    }

    /// Reset all InFlight records to Pending; used at shutdown after the
    /// drain timeout so abandoned attempts are retried on next startup.
    pub fn reset_in_flight(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE delivery_records
                 SET state = 'pending', next_attempt_at = ?1
                 WHERE state = 'in_flight'",
                params![ms(Utc::now())],
            )
            .map_err(db_err)?;
        Ok(n)
    }

    /// Delete Acked/DeadLettered records past the retention window
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = ms(Utc::now()) - self.queue.retention_secs * 1000;
        let n = conn
            .execute(
                "DELETE FROM delivery_records
                 WHERE state IN ('acked', 'dead_lettered') AND finished_at <= ?1",
                params![cutoff],
            )
            .map_err(db_err)?;
        Ok(n)
    }

    /// Aggregate counters
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let mut stats = QueueStats::default();
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM delivery_records GROUP BY state")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (state, count) = row.map_err(db_err)?;
            match DeliveryState::parse(&state) {
                Some(DeliveryState::Pending) => stats.pending = count as u64,
                Some(DeliveryState::InFlight) => stats.in_flight = count as u64,
                Some(DeliveryState::Acked) => stats.acked = count as u64,
                Some(DeliveryState::DeadLettered) => stats.dead_lettered = count as u64,
                None => {}
            }
        }
        Ok(stats)
    }

    /// Most recent dead-lettered records, newest first, for the reporter
    pub fn recent_dead_letters(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, envelope, state, priority, attempt_count, next_attempt_at,
                        last_error, assigned_transport, bytes_sent, history
                 FROM delivery_records
                 WHERE state = 'dead_lettered'
                 ORDER BY finished_at DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_record)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Look up one record by envelope id
    pub fn get(&self, id: Uuid) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, envelope, state, priority, attempt_count, next_attempt_at,
                    last_error, assigned_transport, bytes_sent, history
             FROM delivery_records WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_record,
        )
        .optional()
        .map_err(db_err)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
        let envelope_bytes: Vec<u8> = row.get(1)?;
        let envelope = codec::decode(&envelope_bytes).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Blob,
                Box::new(e),
            )
        })?;
        let state: String = row.get(2)?;
        let assigned: Option<String> = row.get(7)?;
        let history_json: String = row.get(9)?;
        Ok(DeliveryRecord {
            envelope,
            state: DeliveryState::parse(&state).unwrap_or(DeliveryState::Pending),
            priority: row.get::<_, i64>(3)? as u8,
            attempt_count: row.get::<_, i64>(4)? as u32,
            next_attempt_at: from_ms(row.get(5)?),
            last_error: row.get(6)?,
            assigned_transport: assigned.as_deref().and_then(TransportId::parse),
            bytes_sent: row.get::<_, i64>(8)? as u64,
            history: serde_json::from_str(&history_json).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use plategate_core::{DetectionPayload, EnvelopePayload};

    fn payload(plate: &str) -> EnvelopePayload {
        EnvelopePayload::Detection(DetectionPayload {
            plate: plate.to_string(),
            confidence: 0.9,
            lane: None,
            captured_at: None,
            image: None,
        })
    }

    fn envelope(priority: u8) -> Envelope {
        Envelope::new("cam-01", "cp-north", payload("AB123CD")).with_priority(priority)
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::in_memory(QueueSettings::default(), RetrySettings::default()).unwrap()
    }

    fn no_jitter() -> RetrySettings {
        RetrySettings {
            base_ms: 1000,
            max_ms: 300_000,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_priority_ordering() {
        let q = queue();
        for p in [2u8, 0, 1] {
            q.enqueue(&envelope(p)).unwrap();
        }
        let order: Vec<u8> = (0..3)
            .map(|_| q.dequeue_next_ready().unwrap().unwrap().priority)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_created_at_breaks_ties() {
        let q = queue();
        let mut first = envelope(1);
        first.created_at = Utc::now() - ChronoDuration::seconds(10);
        let second = envelope(1);
        q.enqueue(&second).unwrap();
        q.enqueue(&first).unwrap();
        let got = q.dequeue_next_ready().unwrap().unwrap();
        assert_eq!(got.envelope.id, first.id);
    }

    #[test]
    fn test_in_flight_excluded_from_dequeue() {
        let q = queue();
        q.enqueue(&envelope(1)).unwrap();
        let first = q.dequeue_next_ready().unwrap();
        assert!(first.is_some());
        assert!(q.dequeue_next_ready().unwrap().is_none());
    }

    #[test]
    fn test_ack_finishes_record() {
        let q = queue();
        let env = envelope(1);
        q.enqueue(&env).unwrap();
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        let state = q
            .mark_attempted(
                &rec,
                TransportId::Realtime,
                AttemptOutcome::Acked { duplicate: false },
            )
            .unwrap();
        assert_eq!(state, DeliveryState::Acked);
        let stats = q.stats().unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_retryable_failure_schedules_backoff() {
        let q = DeliveryQueue::in_memory(QueueSettings::default(), no_jitter()).unwrap();
        let env = envelope(1);
        q.enqueue(&env).unwrap();
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        let before = Utc::now();
        let state = q
            .mark_attempted(
                &rec,
                TransportId::Http,
                AttemptOutcome::Failed {
                    error: DeliveryError::Timeout("send".into()),
                    bytes_sent: None,
                },
            )
            .unwrap();
        assert_eq!(state, DeliveryState::Pending);

        // Not ready again until the backoff elapses
        assert!(q.dequeue_next_ready().unwrap().is_none());
        let stored = q.get(env.id).unwrap().unwrap();
        assert!(stored.next_attempt_at >= before + ChronoDuration::milliseconds(1000));
        assert_eq!(stored.attempt_count, 1);
    }

    #[test]
    fn test_backoff_growth() {
        let q = DeliveryQueue::in_memory(QueueSettings::default(), no_jitter()).unwrap();
        let mut gaps = Vec::new();
        for attempts in 1..=4 {
            gaps.push(q.backoff(attempts));
        }
        for (n, window) in gaps.windows(2).enumerate() {
            assert!(window[1] >= window[0], "gap {} shrank", n);
        }
        for (n, gap) in gaps.iter().enumerate() {
            let floor = 1000u64 * 2u64.pow(n as u32);
            assert!(*gap >= floor, "gap {} below b * 2^(n-1)", n);
        }
    }

    #[test]
    fn test_backoff_capped() {
        let q = DeliveryQueue::in_memory(
            QueueSettings::default(),
            RetrySettings {
                base_ms: 1000,
                max_ms: 8000,
                jitter: 0.0,
            },
        )
        .unwrap();
        assert_eq!(q.backoff(30), 8000);
    }

    #[test]
    fn test_non_retryable_dead_letters_immediately() {
        let q = queue();
        let env = envelope(1);
        q.enqueue(&env).unwrap();
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        let state = q
            .mark_attempted(
                &rec,
                TransportId::Http,
                AttemptOutcome::Failed {
                    error: DeliveryError::Rejected("schema violation".into()),
                    bytes_sent: None,
                },
            )
            .unwrap();
        assert_eq!(state, DeliveryState::DeadLettered);
        assert_eq!(q.stats().unwrap().dead_lettered, 1);
    }

    #[test]
    fn test_exhausted_budget_dead_letters() {
        let q = DeliveryQueue::in_memory(QueueSettings::default(), no_jitter()).unwrap();
        let env = envelope(1).with_max_attempts(2);
        q.enqueue(&env).unwrap();

        let rec = q.dequeue_next_ready().unwrap().unwrap();
        let state = q
            .mark_attempted(
                &rec,
                TransportId::Realtime,
                AttemptOutcome::Failed {
                    error: DeliveryError::Timeout("t".into()),
                    bytes_sent: None,
                },
            )
            .unwrap();
        assert_eq!(state, DeliveryState::Pending);

        let rec = q.get(env.id).unwrap().unwrap();
        let state = q
            .mark_attempted(
                &rec,
                TransportId::Http,
                AttemptOutcome::Failed {
                    error: DeliveryError::Timeout("t".into()),
                    bytes_sent: None,
                },
            )
            .unwrap();
        assert_eq!(state, DeliveryState::DeadLettered);

        // Transport history records the switch
        let stored = q.get(env.id).unwrap().unwrap();
        let transports: Vec<TransportId> =
            stored.history.iter().map(|n| n.transport).collect();
        assert_eq!(transports, vec![TransportId::Realtime, TransportId::Http]);
    }

    #[test]
    fn test_restart_recovers_in_flight_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let env = envelope(1);

        {
            let q = DeliveryQueue::open(&path, QueueSettings::default(), no_jitter()).unwrap();
            q.enqueue(&env).unwrap();
            let rec = q.dequeue_next_ready().unwrap().unwrap();
            assert_eq!(rec.state, DeliveryState::InFlight);
            // Simulated crash: queue dropped with the record still in flight
        }

        let q = DeliveryQueue::open(&path, QueueSettings::default(), no_jitter()).unwrap();
        let stored = q.get(env.id).unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::Pending);
        assert_eq!(q.stats().unwrap().pending, 1);
        // Not duplicated
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        assert_eq!(rec.envelope.id, env.id);
        assert!(q.dequeue_next_ready().unwrap().is_none());
    }

    #[test]
    fn test_backpressure_evicts_lowest_priority() {
        let settings = QueueSettings {
            max_depth_per_band: 2,
            ..QueueSettings::default()
        };
        let q = DeliveryQueue::in_memory(settings, no_jitter()).unwrap();

        let health = envelope(3);
        q.enqueue(&health).unwrap();
        q.enqueue(&envelope(1)).unwrap();
        q.enqueue(&envelope(1)).unwrap();

        // Band 1 is full; the priority-3 record gives way
        q.enqueue(&envelope(1)).unwrap();
        let evicted = q.get(health.id).unwrap().unwrap();
        assert_eq!(evicted.state, DeliveryState::DeadLettered);
        assert_eq!(evicted.last_error.as_deref(), Some("evicted: queue full"));
    }

    #[test]
    fn test_backpressure_rejects_least_important() {
        let settings = QueueSettings {
            max_depth_per_band: 1,
            ..QueueSettings::default()
        };
        let q = DeliveryQueue::in_memory(settings, no_jitter()).unwrap();
        q.enqueue(&envelope(3)).unwrap();
        let err = q.enqueue(&envelope(3)).unwrap_err();
        assert!(matches!(err, DeliveryError::QueueFull(3)));
    }

    #[test]
    fn test_aged_record_promoted() {
        let settings = QueueSettings {
            age_promotion_secs: 60,
            ..QueueSettings::default()
        };
        let q = DeliveryQueue::in_memory(settings, no_jitter()).unwrap();
        let mut old = envelope(3);
        old.created_at = Utc::now() - ChronoDuration::seconds(120);
        q.enqueue(&old).unwrap();
        q.enqueue(&envelope(3)).unwrap();

        let got = q.dequeue_next_ready().unwrap().unwrap();
        assert_eq!(got.envelope.id, old.id);
        assert_eq!(got.priority, 2); // one band up from 3
    }

    #[test]
    fn test_release_returns_record_without_attempt() {
        let q = queue();
        let env = envelope(1);
        q.enqueue(&env).unwrap();
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        q.release(rec.envelope.id, std::time::Duration::ZERO).unwrap();
        let again = q.dequeue_next_ready().unwrap().unwrap();
        assert_eq!(again.envelope.id, env.id);
        assert_eq!(again.attempt_count, 0);
    }

    #[test]
    fn test_purge_respects_retention() {
        let settings = QueueSettings {
            retention_secs: 0,
            ..QueueSettings::default()
        };
        let q = DeliveryQueue::in_memory(settings, no_jitter()).unwrap();
        let env = envelope(1);
        q.enqueue(&env).unwrap();
        let rec = q.dequeue_next_ready().unwrap().unwrap();
        q.mark_attempted(
            &rec,
            TransportId::Http,
            AttemptOutcome::Acked { duplicate: false },
        )
        .unwrap();
        let purged = q.purge_expired().unwrap();
        assert_eq!(purged, 1);
        assert!(q.get(env.id).unwrap().is_none());
    }
}
