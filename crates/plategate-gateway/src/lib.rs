//! Plategate Gateway - Adaptive Multi-Protocol Telemetry Delivery
//!
//! This crate moves detection and health envelopes from a checkpoint edge
//! node to the central ingestion service over whichever transport the link
//! currently supports, falling back between protocols as connectivity
//! degrades.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Plategate Gateway                      │
//! ├─────────────────────────────────────────────────────────┤
//! │  producer ──▶ ┌────────────────┐                        │
//! │               │ Delivery Queue │ (durable, priority)    │
//! │               └───────┬────────┘                        │
//! │                       │ dequeue                         │
//! │            ┌──────────▼──────────┐                      │
//! │            │  Protocol Selector  │◀── Connectivity      │
//! │            └──────────┬──────────┘    Monitor + Breaker │
//! │       ┌───────────────┼───────────────┐                 │
//! │  ┌────▼────┐     ┌────▼────┐     ┌────▼────┐            │
//! │  │Real-time│     │  HTTP   │     │ Pub/Sub │            │
//! │  │   WS    │     │  POST   │     │  MQTT   │            │
//! │  └────┬────┘     └────┬────┘     └────┬────┘            │
//! └───────┼───────────────┼───────────────┼─────────────────┘
//!         └───────────────┴───────────────┘
//!                 Central Ingestion (dedup + ack)
//! ```
//!
//! # Features
//!
//! - **Three transports**: real-time WebSocket, HTTP request/response, MQTT
//!   publish/subscribe, behind one [`Transport`] trait
//! - **Connectivity scoring**: passive attempt observation plus active probes
//! - **Circuit breaking**: per-transport Closed/Open/HalfOpen with bounded
//!   exponential cool-down
//! - **Durable queue**: SQLite-backed, priority-ordered, survives restart
//! - **Retry with backoff**: exponential, jittered, capped; exhausted records
//!   are dead-lettered, never dropped silently

pub mod breaker;
pub mod config;
pub mod gateway;
pub mod monitor;
pub mod queue;
pub mod reporter;
pub mod selector;
pub mod transport;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayStatus};
pub use monitor::{ConnectivityMonitor, HealthSnapshot, TransportHealth};
pub use queue::{AttemptOutcome, DeliveryQueue, DeliveryRecord, DeliveryState, QueueStats};
pub use reporter::{HealthReport, HealthReporter};
pub use selector::ProtocolSelector;
pub use transport::{Ack, SendFailure, SendResult, Transport, TransportId};

// Shared error taxonomy lives in plategate-core so the gateway and the
// ingestion service classify retryability identically.
pub use plategate_core::{DeliveryError, Result};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
