//! MCP server entry point: `edgehelm-mcp [--config <path>] [--db <path>]`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use edgehelm::config::Config;
use edgehelm::server;

#[derive(Parser)]
#[command(
    name = "edgehelm-mcp",
    about = "edgehelm host copilot MCP server (stdio transport)",
    version
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file, overriding the configured location
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config =
        Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.storage.path = Some(db);
    }
    server::start_mcp_server(config).await
}
