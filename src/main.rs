//! Lodestone — a standalone Mainline BitTorrent DHT node.
//!
//! Joins the DHT from the well-known bootstrap router, maintains its routing
//! table, serves the four standard query types, and logs aggregate message
//! stats until interrupted.

use clap::Parser;
use lodestone::net::{log_stats, DhtNode, NodeConfig};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lodestone", version, about = "Mainline BitTorrent DHT node")]
struct Args {
    /// Node id, 40 hex chars; random when omitted
    #[arg(long)]
    node_id: Option<String>,

    /// UDP port; random in 1025..65535 when omitted
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds between stats log lines
    #[arg(long, default_value = "60")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lodestone=info")),
        )
        .init();

    let args = Args::parse();
    let node = DhtNode::new(NodeConfig {
        node_id: args.node_id,
        node_port: args.port,
    });
    node.start().await?;

    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval));
    stats.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = stats.tick() => log_stats(&[&node]),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.stop().await;
    info!("Node stopped");
    Ok(())
}
