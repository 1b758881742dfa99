//! CLI command definitions and handlers

pub mod config;

use clap::{Parser, Subcommand};

/// chatrelay - chat orchestration server with resumable streams and MCP tools
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the chat API server
    Serve(ServeArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long, env = "CHATRELAY_PORT")]
    pub port: Option<u16>,

    /// Hostname to bind to (overrides config)
    #[arg(long, env = "CHATRELAY_HOSTNAME")]
    pub hostname: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,

    /// Initialize default configuration
    #[arg(long)]
    pub init: bool,
}

/// Load config and start the server.
pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = crate::config::Config::load().await?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(hostname) = args.hostname {
        config.server.hostname = hostname;
    }
    crate::server::serve(config).await
}
