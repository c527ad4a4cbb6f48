//! `analyticsd`: the video-analytics runtime daemon.
//!
//! Without a subcommand this runs the supervisor (control plane plus the
//! analyzer status machine). The hidden `driver` subcommand is how the
//! supervisor re-execs this binary to run one analyzer in an isolated
//! process.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use video_analytics_supervisor::process::ProcessDriverSpawner;
use video_analytics_supervisor::{api, driver, AnalyzerManager, RuntimeConfig};

#[derive(Parser)]
#[command(name = "analyticsd", version, about = "Distributed video-analytics runtime")]
struct Cli {
    /// Runtime configuration file.
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single analyzer driver (spawned by the supervisor).
    #[command(hide = true)]
    Driver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let is_driver = matches!(cli.command, Some(Command::Driver));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if is_driver {
        // Driver stdout is the control channel; logs go to stderr.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RuntimeConfig::load(&cli.config)?;

    if is_driver {
        driver::run_driver(&config).await
    } else {
        run_supervisor(config, cli.config).await
    }
}

async fn run_supervisor(config: RuntimeConfig, config_path: PathBuf) -> anyhow::Result<()> {
    info!("starting analyzer supervisor");
    let client = async_nats::connect(config.messaging.hosts.join(",")).await?;
    let spawner = Arc::new(ProcessDriverSpawner::new(config_path));
    let manager = AnalyzerManager::new(spawner);
    api::serve(client, manager).await
}
