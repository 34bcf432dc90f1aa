//! Plategate Core - Shared Telemetry Data Model
//!
//! This crate defines the canonical message envelope exchanged between a
//! checkpoint edge node and the central ingestion service, together with the
//! wire codec used by every transport and the delivery error taxonomy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   Edge Gateway                        │
//! │  producer ──▶ Envelope ──▶ codec::encode ──▶ bytes   │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ real-time / HTTP / pub-sub
//! ┌──────────────────────────▼───────────────────────────┐
//! │                Central Ingestion                      │
//! │  bytes ──▶ codec::decode ──▶ Envelope ──▶ dedup/ack  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The same encoded form is accepted by all three transports: adapters may
//! wrap it (an MQTT payload, an HTTP body, a WebSocket text frame) but never
//! alter it.

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::{decode, encode, CodecError};
pub use envelope::{
    ControlPayload, DetectionPayload, Envelope, EnvelopeKind, EnvelopePayload, ImageData,
};
pub use error::{DeliveryError, Result};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default retry budget for an envelope
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
