#![warn(missing_docs)]

//! tabletmgr tablet agent daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tabletmgr_agent::engine::serve_engine_feed;
use tabletmgr_agent::rpc::serve_rpc;
use tabletmgr_agent::{Agent, AgentConfig, AgentContext, DataEngine, MemoryEngine, TcpDialer, TcpFeed};
use tabletmgr_topo::{RemoteTopoClient, TabletAlias, Topo, TopoStore};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs the agent for one tablet.
#[derive(Debug, Parser)]
#[command(name = "tm-agent", about = "tabletmgr tablet agent")]
struct Args {
    /// Coordination store address.
    #[arg(long, env = "TM_TOPO", default_value = "127.0.0.1:15000")]
    topo: String,

    /// Tablet alias (`cell-uid`).
    #[arg(long)]
    tablet: TabletAlias,

    /// Config file (TOML or JSON).
    #[arg(long, env = "TM_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind listeners on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Agent RPC port override.
    #[arg(long)]
    port: Option<u16>,

    /// Data engine port override.
    #[arg(long)]
    engine_port: Option<u16>,

    /// Snapshot root override.
    #[arg(long)]
    snapshot_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(tablet = %args.tablet, topo = %args.topo, "tabletmgr agent starting...");

    let mut config = match &args.config {
        Some(path) if path.exists() => AgentConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            AgentConfig::default()
        }
        None => AgentConfig::default(),
    };
    if args.port.is_some() {
        config.port = args.port;
    }
    if args.engine_port.is_some() {
        config.engine_port = args.engine_port;
    }
    if let Some(root) = args.snapshot_root {
        config.snapshot_root = root;
    }

    let store: Arc<dyn TopoStore> = Arc::new(
        RemoteTopoClient::connect(&args.topo)
            .await
            .with_context(|| format!("connecting to coordination store {}", args.topo))?,
    );
    let tablet = Topo::new(store.clone())
        .get_tablet(&args.tablet)
        .await
        .with_context(|| format!("reading tablet record {}", args.tablet))?;
    let port = config.port.unwrap_or(tablet.port);
    let engine_port = config.engine_port.unwrap_or(tablet.engine_port);
    let hostname = config.hostname.clone().unwrap_or_else(|| tablet.hostname.clone());

    let engine: Arc<dyn DataEngine> = MemoryEngine::new(
        format!("{}:{}", hostname, engine_port),
        Arc::new(TcpFeed::new(config.rpc_timeout())),
    );
    let engine_listener = TcpListener::bind((args.bind.as_str(), engine_port))
        .await
        .with_context(|| format!("binding engine port {}", engine_port))?;
    let rpc_listener = TcpListener::bind((args.bind.as_str(), port))
        .await
        .with_context(|| format!("binding agent port {}", port))?;

    let dialer = Arc::new(TcpDialer::new(config.auth_token.clone()));
    let ctx = AgentContext::new(args.tablet.clone(), store, engine.clone(), config, dialer);
    let agent = Agent::start(ctx).await?;

    let feed_handle = tokio::spawn(serve_engine_feed(engine_listener, engine));
    let rpc_handle = tokio::spawn(serve_rpc(rpc_listener, agent.rpc()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("signal received, interrupting agent");
        }
        r = feed_handle => tracing::error!("engine feed stopped: {:?}", r),
        r = rpc_handle => tracing::error!("agent RPC stopped: {:?}", r),
    }
    agent.interrupt().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
