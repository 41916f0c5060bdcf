mod cli;
mod codegen;
mod config;
mod driver;
mod model;
mod orchestrator;
mod reconcile;
mod sse;
mod store;
mod symbols;
mod text_summary;
mod wire;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = cli::Cli::parse();
    cli::run(args).await
}
