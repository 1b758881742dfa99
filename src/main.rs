//! chatrelay - chat orchestration server
//!
//! Streams model output over resumable SSE, discovers tools from MCP
//! capability providers per request, and persists every turn once.

use chatrelay::cli::{self, Cli, Command};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => cli::serve(args).await,
        Command::Config(args) => cli::config::execute(args).await,
    }
}
