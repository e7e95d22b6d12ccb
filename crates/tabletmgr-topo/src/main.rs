#![warn(missing_docs)]

//! tm-topo: development coordination store served over TCP.

use anyhow::{Context, Result};
use clap::Parser;
use tabletmgr_topo::{serve_memory_topo, MemoryTopoServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// In-memory coordination store for development clusters and tests.
#[derive(Parser, Debug)]
#[command(name = "tm-topo", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "TM_TOPO_LISTEN", default_value = "127.0.0.1:15000")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!(addr = %args.listen, "tm-topo starting");

    let server = MemoryTopoServer::new();
    tokio::select! {
        res = serve_memory_topo(listener, server) => res.context("topo server failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
