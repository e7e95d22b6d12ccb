#![warn(missing_docs)]

//! tabletmgr operator CLI

use anyhow::Result;
use clap::Parser;
use tabletmgr_ctl::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "tmctl starting");
    cli.run().await
}
