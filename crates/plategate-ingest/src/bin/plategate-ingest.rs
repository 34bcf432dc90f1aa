#!/usr/bin/env cargo
//! Plategate Ingest Binary
//!
//! Runs the central ingestion service: HTTP + WebSocket server plus the
//! pub/sub consumer, all feeding one acceptance path.
//!
//! # Usage
//! ```bash
//! plategate-ingest [--config ingest.json] [--bind 0.0.0.0:8080] [--store ./data] [--verbose]
//! ```

use clap::Parser;
use plategate_ingest::{server, AckStore, EnvelopeStore, IngestConfig, IngestState, WatchList};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Plategate Ingest - Central Telemetry Ingestion
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP/WS bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Storage directory for accepted envelopes
    #[arg(long)]
    store: Option<String>,

    /// Pub/sub broker host
    #[arg(long)]
    mqtt_host: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false)
            .init();
    }

    let mut config = match &args.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config = config.with_bind_addr(bind);
    }
    if let Some(store) = &args.store {
        config = config.with_store_path(store);
    }
    if let Some(host) = args.mqtt_host.clone() {
        config.mqtt_host = host;
    }

    print_banner(&config);

    let store = match &config.store_path {
        Some(path) => EnvelopeStore::open(path).await?,
        None => {
            tracing::warn!("no store path configured, accepted envelopes will be discarded");
            EnvelopeStore::discard()
        }
    };
    let state = Arc::new(IngestState::new(
        AckStore::new(config.dedup_retention_secs),
        WatchList::new(config.watchlist.clone()),
        store,
        config.api_key.clone(),
    ));

    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    let consumer = tokio::spawn(plategate_ingest::consumer::run_consumer(
        state.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
        config.mqtt_namespace.clone(),
        cancel.clone(),
    ));
    let purger = tokio::spawn(server::run_dedup_purger(
        state.clone(),
        server::DEDUP_PURGE_INTERVAL,
        cancel.clone(),
    ));

    server::run(state, &config.bind_addr, cancel.clone()).await?;
    consumer.await?;
    purger.await?;
    Ok(())
}

fn print_banner(config: &IngestConfig) {
    println!();
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║                                                               ║");
    println!("║         📥  PLATEGATE INGEST — CENTRAL INGESTION  📥          ║");
    println!("║                                                               ║");
    println!("║     Multi-Channel Envelope Acceptance with Dedup              ║");
    println!("║                                                               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("🔗 Surfaces");
    println!("   ├─ POST /api/cameras/register");
    println!("   ├─ POST /api/detection | /api/health | /api/envelope");
    println!("   ├─ GET  /api/test");
    println!("   ├─ WS   /ws");
    println!(
        "   └─ MQTT {}/cameras/+/{{detection,health}} @ {}:{}",
        config.mqtt_namespace, config.mqtt_host, config.mqtt_port
    );
    println!();
    println!("📦 Storage");
    match &config.store_path {
        Some(path) => println!("   └─ Ledger at {}", path.display()),
        None => println!("   └─ Discard mode (no persistence)"),
    }
    println!();
    println!("🎯 Watch-list: {} plate(s)", config.watchlist.len());
    println!();
    println!("─────────────────────────────────────────────────────────────────");
    println!("Listening on {} — press Ctrl+C to stop", config.bind_addr);
    println!();
}
