use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use control_plane::config::ControlPlaneConfig;
use control_plane::{server, telemetry};

#[derive(Debug, Parser)]
#[command(name = "control-plane")]
#[command(about = "Multi-tenant deployment control plane")]
struct Cli {
    /// Config file; defaults to `NIXOPUS_CONFIG_PATH` or the system path.
    #[arg(long, global = true, env = "NIXOPUS_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and run the background workers.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing();

    let config = match &cli.config {
        Some(path) => ControlPlaneConfig::load_from(path)?,
        None => ControlPlaneConfig::load()?,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::run(config).await,
        Command::Migrate => server::migrate(&config).await,
    }
}
