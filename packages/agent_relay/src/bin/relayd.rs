//! Standalone broker daemon.
//!
//! Binds the ingress and egress addresses and proxies frames between
//! them until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_relay::{Broker, RelayConfig};

#[derive(Parser)]
#[command(name = "relayd")]
#[command(about = "Broadcast broker for streaming agent replies")]
struct Args {
    /// Producer-facing ingress address (overrides RELAY_INGRESS_ADDR)
    #[arg(long)]
    ingress: Option<String>,

    /// Consumer-facing egress address (overrides RELAY_EGRESS_ADDR)
    #[arg(long)]
    egress: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = RelayConfig::from_env().context("failed to load relay configuration")?;
    if let Some(ingress) = args.ingress {
        config.ingress_addr = ingress;
    }
    if let Some(egress) = args.egress {
        config.egress_addr = egress;
    }

    let broker = Broker::new(config);
    broker.start().await.context("failed to start broker")?;
    if let Some((ingress, egress)) = broker.local_addrs().await {
        info!(%ingress, %egress, "relayd ready");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    broker.stop().await;
    Ok(())
}
