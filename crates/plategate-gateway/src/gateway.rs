//! Gateway orchestration
//!
//! Wires the delivery queue, connectivity monitor, circuit breaker and the
//! three transport adapters into the worker model: one delivery worker per
//! transport, a dispatcher that runs protocol selection per attempt, an
//! active prober and the health reporter. Graceful shutdown stops new
//! dequeues, gives in-flight attempts a drain window, then resets whatever
//! is left to Pending for the next startup.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use plategate_core::{DeliveryError, Envelope, Result};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::GatewayConfig;
use crate::monitor::{ConnectivityMonitor, HealthSnapshot};
use crate::queue::{AttemptOutcome, DeliveryQueue, DeliveryRecord, QueueStats};
use crate::reporter::HealthReporter;
use crate::selector::ProtocolSelector;
use crate::transport::{
    HttpTransport, PubSubDriver, PubSubTransport, RealtimeTransport, SendFailure, Transport,
    TransportId,
};

/// Idle pause between queue polls when nothing is ready
const DEQUEUE_IDLE: Duration = Duration::from_millis(100);

/// Re-check delay for a record that could not be dispatched right now
const UNDISPATCHABLE_DELAY: Duration = Duration::from_millis(500);

/// Read-only snapshot for the dashboard's status query
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub version: &'static str,
    pub device_id: String,
    pub queue: QueueStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub transports: Vec<HealthSnapshot>,
}

/// The telemetry delivery gateway
pub struct Gateway {
    config: GatewayConfig,
    queue: Arc<DeliveryQueue>,
    monitor: Arc<ConnectivityMonitor>,
    breaker: Arc<CircuitBreaker>,
    selector: Arc<ProtocolSelector>,
    realtime: Arc<RealtimeTransport>,
    http: Arc<HttpTransport>,
    pubsub: Arc<PubSubTransport>,
    pubsub_driver: parking_lot::Mutex<Option<PubSubDriver>>,
    control_rx: parking_lot::Mutex<Option<mpsc::Receiver<Envelope>>>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Build a gateway from configuration. Opens (or recovers) the durable
    /// queue and constructs all three transports; nothing runs until
    /// [`Gateway::run`].
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let queue = Arc::new(match &config.queue.path {
            Some(path) => DeliveryQueue::open(path, config.queue.clone(), config.retry.clone())?,
            None => DeliveryQueue::in_memory(config.queue.clone(), config.retry.clone())?,
        });
        let monitor = Arc::new(ConnectivityMonitor::new(config.monitor.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let selector = Arc::new(ProtocolSelector::new(
            monitor.clone(),
            breaker.clone(),
            &config.monitor,
        ));

        let attempt_timeout = Duration::from_secs(config.attempt_timeout_secs);
        let (control_tx, control_rx) = mpsc::channel(32);

        let realtime = Arc::new(
            RealtimeTransport::new(
                &config.endpoints.ws_url,
                &config.device_id,
                &config.checkpoint_id,
                attempt_timeout,
            )
            .with_control_sink(control_tx.clone()),
        );
        let http = Arc::new(HttpTransport::new(
            &config.endpoints.http_base_url,
            attempt_timeout,
            config.endpoints.api_key.clone(),
        )?);
        let (pubsub, pubsub_driver) = PubSubTransport::new(
            &config.endpoints.mqtt_host,
            config.endpoints.mqtt_port,
            &config.endpoints.mqtt_namespace,
            &config.device_id,
            Some(control_tx),
        );

        Ok(Self {
            config,
            queue,
            monitor,
            breaker,
            selector,
            realtime,
            http,
            pubsub: Arc::new(pubsub),
            pubsub_driver: parking_lot::Mutex::new(Some(pubsub_driver)),
            control_rx: parking_lot::Mutex::new(Some(control_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Producer surface: hand an envelope to the delivery queue
    pub fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        self.queue.enqueue(envelope)
    }

    /// Take the stream of server-pushed control/config envelopes. Yields
    /// `None` after the first call.
    pub fn control_messages(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.control_rx.lock().take()
    }

    /// Read-only status snapshot
    pub fn status(&self) -> Result<GatewayStatus> {
        Ok(GatewayStatus {
            version: crate::VERSION,
            device_id: self.config.device_id.clone(),
            queue: self.queue.stats()?,
            breakers: self.breaker.snapshot(),
            transports: self.monitor.snapshot(),
        })
    }

    /// Signal graceful shutdown
    pub fn shutdown(&self) {
        tracing::info!("gateway shutdown requested");
        self.cancel.cancel();
    }

    /// Run the gateway until shutdown, then drain.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            device = %self.config.device_id,
            checkpoint = %self.config.checkpoint_id,
            "gateway starting"
        );

        // Best-effort registration; transports recover on their own either way
        if let Err(e) = self
            .http
            .register(&self.config.device_id, &self.config.checkpoint_id)
            .await
        {
            tracing::warn!(error = %e, "camera registration deferred");
        }

        let mut tasks = JoinSet::new();

        if let Some(driver) = self.pubsub_driver.lock().take() {
            tasks.spawn(driver.run(self.cancel.clone()));
        }
        tasks.spawn(self.realtime.clone().run_reconnect(self.cancel.clone()));

        let transports: Vec<Arc<dyn Transport>> = vec![
            self.realtime.clone(),
            self.http.clone(),
            self.pubsub.clone(),
        ];
        tasks.spawn(
            self.monitor
                .clone()
                .run_prober(transports.clone(), self.cancel.clone()),
        );

        let reporter = HealthReporter::new(
            &self.config.device_id,
            &self.config.checkpoint_id,
            self.queue.clone(),
            self.monitor.clone(),
            self.breaker.clone(),
            Duration::from_secs(self.config.reporter.interval_secs),
        );
        tasks.spawn(reporter.run(self.cancel.clone()));

        let mut senders = HashMap::new();
        for transport in transports {
            let (tx, rx) = mpsc::channel::<DeliveryRecord>(1);
            senders.insert(transport.id(), tx);
            tasks.spawn(run_worker(
                transport,
                self.queue.clone(),
                self.monitor.clone(),
                self.breaker.clone(),
                rx,
                Duration::from_secs(self.config.attempt_timeout_secs),
                self.config.queue.resume_threshold_bytes,
            ));
        }
        tasks.spawn(run_dispatcher(
            self.queue.clone(),
            self.selector.clone(),
            self.breaker.clone(),
            senders,
            self.cancel.clone(),
        ));

        self.cancel.cancelled().await;

        // Drain: the dispatcher stops dequeuing on cancel and drops the
        // worker channels; give running attempts the drain window, then
        // abandon the rest.
        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        let deadline = tokio::time::Instant::now() + drain;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("drain timeout reached, abandoning remaining attempts");
                    tasks.abort_all();
                    break;
                }
            }
        }

        let reset = self.queue.reset_in_flight()?;
        if reset > 0 {
            tracing::info!(reset, "in-flight records persisted as pending");
        }
        tracing::info!("gateway stopped");
        Ok(())
    }
}

/// One delivery worker: pulls dispatched records, runs the bounded attempt,
/// and reports the outcome to the queue, monitor and breaker.
async fn run_worker(
    transport: Arc<dyn Transport>,
    queue: Arc<DeliveryQueue>,
    monitor: Arc<ConnectivityMonitor>,
    breaker: Arc<CircuitBreaker>,
    mut rx: mpsc::Receiver<DeliveryRecord>,
    attempt_timeout: Duration,
    resume_threshold: u64,
) {
    let id = transport.id();
    while let Some(record) = rx.recv().await {
        let resume_from = record.resume_from(resume_threshold);
        let started = std::time::Instant::now();

        let result = match tokio::time::timeout(
            attempt_timeout,
            transport.send(&record.envelope, resume_from),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendFailure::from(DeliveryError::Timeout(format!(
                "attempt exceeded {:?}",
                attempt_timeout
            )))),
        };

        let outcome = match result {
            Ok(ack) => {
                monitor.record_success(id, started.elapsed());
                breaker.record_success(id);
                AttemptOutcome::Acked {
                    duplicate: ack.duplicate,
                }
            }
            Err(failure) => {
                monitor.record_failure(id);
                breaker.record_failure(id);
                AttemptOutcome::Failed {
                    error: failure.error,
                    bytes_sent: failure.confirmed_bytes,
                }
            }
        };

        if let Err(e) = queue.mark_attempted(&record, id, outcome) {
            tracing::error!(transport = %id, id = %record.envelope.id, error = %e, "failed to record attempt outcome");
        }
    }
    tracing::debug!(transport = %id, "delivery worker stopped");
}

/// Dispatcher: dequeues ready records and routes each through per-attempt
/// protocol selection. A record that cannot be dispatched right now (all
/// breakers open, or the chosen worker is saturated) is released back to
/// Pending without consuming an attempt.
async fn run_dispatcher(
    queue: Arc<DeliveryQueue>,
    selector: Arc<ProtocolSelector>,
    breaker: Arc<CircuitBreaker>,
    senders: HashMap<TransportId, mpsc::Sender<DeliveryRecord>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let record = match queue.dequeue_next_ready() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "dequeue failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(UNDISPATCHABLE_DELAY) => continue,
                }
            }
        };

        let Some(record) = record else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(DEQUEUE_IDLE) => continue,
            }
        };

        match selector.select() {
            Some(id) => {
                let sender = senders.get(&id).expect("worker for every transport");
                match sender.try_send(record) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(record))
                    | Err(mpsc::error::TrySendError::Closed(record)) => {
                        // Keep other transports flowing instead of blocking
                        // on a saturated worker
                        breaker.abort_trial(id);
                        if let Err(e) = queue.release(record.envelope.id, DEQUEUE_IDLE) {
                            tracing::error!(error = %e, "failed to release record");
                        }
                    }
                }
            }
            None => {
                // Every transport excluded; the record stays Pending until
                // the monitor or breaker reports improvement
                if let Err(e) = queue.release(record.envelope.id, UNDISPATCHABLE_DELAY) {
                    tracing::error!(error = %e, "failed to release record");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(UNDISPATCHABLE_DELAY) => {}
                }
            }
        }
    }
    tracing::debug!("dispatcher stopped");
    // Dropping the senders lets workers finish buffered records and exit
}
