//! # Live Offer Feed Monitor
//!
//! Runs an `OfferEngine` against a real upstream for a fixed time and prints
//! every snapshot it publishes, followed by the final status and aggregates.
//! Useful to eyeball stream/poll failover against a deployed feed.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lib_common::configs::EngineConfig;
use lib_common::engine::OfferEngine;
use lib_common::markets::gpu::{OfferQuery, Snapshot};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Watch a GPU offer feed through the engine", long_about = None)]
struct Args {
    /// Base URL of the upstream REST API
    #[clap(long, default_value = "http://localhost:8000")]
    base_url: String,

    /// Feed name
    #[clap(long, default_value = "aws-spot")]
    feed: String,

    /// Optional engine config file; flags above override it
    #[clap(long)]
    config: Option<std::path::PathBuf>,

    /// How long to run, in seconds
    #[clap(short, long, default_value_t = 120)]
    seconds: u64,

    /// Run poll-only
    #[clap(long)]
    no_stream: bool,
}

fn print_snapshot(s: &Snapshot) {
    let origin = s.origin.map(|o| format!("{:?}", o)).unwrap_or_else(|| "-".into());
    println!(
        "#{:<4} {:<7} {:>4} offers  {:>2} models  {:>2} regions  source={}  updated={}",
        s.sequence,
        origin,
        s.metadata.total_count,
        s.metadata.models.len(),
        s.metadata.regions.len(),
        s.metadata.data_source,
        s.metadata
            .last_updated
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into()),
    );
    if let Some(error) = &s.error {
        println!("      error: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    config.base_url = args.base_url.clone();
    config.feed = args.feed.clone();
    config.stream_enabled = !args.no_stream;
    println!("{}", config);

    let engine = OfferEngine::new(config)?;
    let sub = engine.subscribe(|s: Arc<Snapshot>| print_snapshot(&s))?;

    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = engine.status();
                println!(
                    "  mode={} stream={:?} rejected={} duplicates={} stale_polls={} error={}",
                    status.mode,
                    status.stream_state,
                    status.rejected_records,
                    status.duplicate_records,
                    status.stale_poll_results,
                    status.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    let stats = engine.stats(&OfferQuery::default());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(summary) = engine.summary() {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    sub.unsubscribe();
    engine.shutdown().await;
    Ok(())
}
