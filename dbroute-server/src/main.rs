use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use dbroute_core::{Config, Repository};
use dbroute_server::tracing_setup::{init_tracing, TracingConfig};
use dbroute_server::{run_server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dbroute-server", version, about = "Database router health and diagnostics server")]
struct Cli {
    /// Address to bind to
    #[arg(long, env = "DBROUTE_BIND", default_value = "127.0.0.1:3030")]
    bind: SocketAddr,

    /// Allow any CORS origin instead of localhost only
    #[arg(long)]
    cors_permissive: bool,

    /// Debug logging unless RUST_LOG is set
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug })?;

    let config = Config::from_env();
    tracing::info!(
        environment = %config.environment.name,
        production = config.environment.production,
        "Configuration loaded"
    );
    let repo = Arc::new(Repository::from_config(config));

    run_server(
        repo,
        ServerConfig {
            bind_addr: cli.bind,
            cors_permissive: cli.cors_permissive,
        },
    )
    .await
    .context("server failed")
}
