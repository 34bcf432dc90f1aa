//! Plategate Ingest - Central Telemetry Ingestion
//!
//! Receives envelopes from checkpoint gateways over all three delivery
//! channels and funnels them through one acceptance path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Plategate Ingest                       │
//! ├──────────────────────────────────────────────────────────┤
//! │   WS /ws        HTTP /api/*        MQTT consumer          │
//! │      │               │                  │                 │
//! │      └───────────────┼──────────────────┘                 │
//! │                      ▼                                    │
//! │          decode → dedup → watch-list → persist → ack      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **One acceptance path**: every surface delegates to [`server::ingest`]
//! - **Idempotent delivery**: acknowledgment records keyed by envelope id;
//!   duplicates ack without re-persisting
//! - **Watch-list**: normalized plate matching flags detections of interest
//! - **Append-only ledger**: accepted envelopes land in a JSONL file with
//!   receipt metadata

pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod server;
pub mod store;
pub mod watchlist;

pub use config::IngestConfig;
pub use dedup::{AckRecord, AckStore};
pub use error::{IngestError, Result};
pub use server::{ingest, IngestOutcome, IngestState};
pub use store::{EnvelopeStore, StoredEnvelope};
pub use watchlist::WatchList;

/// Ingestion service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
