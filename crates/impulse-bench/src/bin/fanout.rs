//! Fan-out load driver for Impulse.
//!
//! Emits impulses to every channel of a registry and measures how long it
//! takes until all listeners have seen them.
//!
//! ## Usage
//!
//! ```bash
//! # 16 channels, 10k impulses, default config
//! fanout
//!
//! # Custom sizes and bus config
//! fanout --channels 64 --impulses 50000 --config /path/to/impulse.toml
//! ```

use anyhow::{bail, Context, Result};
use impulse_core::{metrics, Bus, BusConfig, ChannelRegistry, Impulse, ListenerInfo};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENTITY: &str = "fanout";

struct Args {
    channels: usize,
    impulses: u64,
    config: Option<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Self {
            channels: 16,
            impulses: 10_000,
            config: None,
        };
        let mut raw = std::env::args().skip(1);
        while let Some(flag) = raw.next() {
            let value = raw
                .next()
                .with_context(|| format!("missing value for {flag}"))?;
            match flag.as_str() {
                "--channels" => args.channels = value.parse().context("--channels")?,
                "--impulses" => args.impulses = value.parse().context("--impulses")?,
                "--config" => args.config = Some(value),
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout=info,impulse_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse()?;
    let config = match &args.config {
        Some(path) => BusConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => BusConfig::default(),
    };
    metrics::describe_metrics();

    let registry = Arc::new(ChannelRegistry::with_config(config));
    let delivered = Arc::new(AtomicU64::new(0));
    let names: Vec<String> = (0..args.channels).map(|i| format!("ch-{i}")).collect();

    for name in &names {
        let channel = registry.create(ENTITY, name)?;
        let counter = Arc::clone(&delivered);
        channel.add_listener(ListenerInfo::new("counter", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }))?;
    }
    info!(channels = args.channels, impulses = args.impulses, "Starting fan-out run");

    let start = Instant::now();
    let mut accepted = 0u64;
    let mut refused = 0u64;
    for seq in 0..args.impulses {
        let mut impulse = Impulse::new();
        impulse.set_bus(registry.clone());
        impulse.set_emitter(&json!({ "id": "fanout.driver" }))?;
        for name in &names {
            impulse.add_frequency(ENTITY, name)?;
        }
        impulse.set_content(&json!({ "seq": seq }))?;

        match impulse.emit() {
            Ok(count) => accepted += count as u64,
            Err(err) => {
                refused += 1;
                warn!(seq, "Emit failed: {}", err);
            }
        }
    }
    let emitted = start.elapsed();

    for name in &names {
        if let Some(channel) = registry.get(ENTITY, name) {
            channel.settled().await;
        }
    }
    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::Relaxed);

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Channels:             {:>10}                           ║", args.channels);
    println!("║  Impulses:             {:>10}                           ║", args.impulses);
    println!("║  Refused emits:        {:>10}                           ║", refused);
    println!("║  Accepted sends:       {:>10}                           ║", accepted);
    println!("║  Deliveries:           {:>10}                           ║", total);
    println!("║  Emit phase:           {:>10.2}s                          ║", emitted.as_secs_f64());
    println!("║  Total:                {:>10.2}s                          ║", elapsed.as_secs_f64());
    println!(
        "║  Throughput:           {:>10.0} deliveries/s             ║",
        total as f64 / elapsed.as_secs_f64()
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    Ok(())
}
