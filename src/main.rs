use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use portald::config::ServerConfig;

#[derive(Parser)]
#[command(name = "portald")]
#[command(version, about = "Pull request preview environment orchestrator")]
struct Cli {
    /// Path to the config file (default: ./portald.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the API bind port
    #[arg(long)]
    port: Option<u16>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "portald=debug"
    } else {
        "portald=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    portald::server::run(config).await
}
