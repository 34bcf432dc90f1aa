#!/usr/bin/env cargo
//! Plategate Gateway Binary
//!
//! Runs the telemetry delivery gateway on a checkpoint edge node.
//!
//! # Usage
//! ```bash
//! plategate-gateway [--config gateway.json] [--device-id cam-01] [--server ingest.local] [--verbose]
//! ```

use clap::Parser;
use plategate_gateway::{Gateway, GatewayConfig};
use std::sync::Arc;

/// Plategate Gateway - Adaptive Multi-Protocol Telemetry Delivery
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Device identifier (overrides the config file)
    #[arg(long)]
    device_id: Option<String>,

    /// Checkpoint identifier (overrides the config file)
    #[arg(long)]
    checkpoint_id: Option<String>,

    /// Central ingestion host; sets all three transport endpoints
    #[arg(short, long)]
    server: Option<String>,

    /// Durable queue path (default: in-memory)
    #[arg(long)]
    queue_path: Option<String>,

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
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let (Some(device), Some(checkpoint)) = (&args.device_id, &args.checkpoint_id) {
        config = config.with_device(device, checkpoint);
    } else if let Some(device) = &args.device_id {
        let checkpoint = config.checkpoint_id.clone();
        config = config.with_device(device, checkpoint);
    }
    if let Some(server) = &args.server {
        config = config.with_server(server);
    }
    if let Some(path) = &args.queue_path {
        config = config.with_queue_path(path);
    }

    print_banner(&config);

    let gateway = Arc::new(Gateway::new(config)?);

    let signal_gateway = gateway.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_gateway.shutdown();
        }
    });

    gateway.run().await?;
    Ok(())
}

fn print_banner(config: &GatewayConfig) {
    println!();
    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║                                                               ║");
    println!("║        🛰  PLATEGATE GATEWAY — TELEMETRY DELIVERY  🛰         ║");
    println!("║                                                               ║");
    println!("║     Adaptive Multi-Protocol Delivery for Edge Checkpoints     ║");
    println!("║                                                               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝");
    println!();
    println!("🪪 Identity");
    println!("   ├─ Device:     {}", config.device_id);
    println!("   └─ Checkpoint: {}", config.checkpoint_id);
    println!();
    println!("🔗 Transports (fallback order)");
    println!("   ├─ Real-time:  {}", config.endpoints.ws_url);
    println!("   ├─ HTTP:       {}", config.endpoints.http_base_url);
    println!(
        "   └─ Pub/Sub:    mqtt://{}:{}",
        config.endpoints.mqtt_host, config.endpoints.mqtt_port
    );
    println!();
    println!("📦 Delivery Queue");
    match &config.queue.path {
        Some(path) => println!("   └─ Durable at {}", path.display()),
        None => println!("   └─ In-memory (envelopes lost on restart)"),
    }
    println!();
    println!("─────────────────────────────────────────────────────────────────");
    println!("Press Ctrl+C to stop the gateway");
    println!();
}
