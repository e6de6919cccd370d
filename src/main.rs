//! fleetd daemon entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetd::cancel::CancelSource;
use fleetd::config::CoordinatorConfig;
use fleetd::quota::StaticOracle;
use fleetd::verifiers::VerifierRegistry;
use fleetd::CoordinatorContext;

#[derive(Parser)]
#[command(name = "fleetd", version, about = "Multi-agent fleet coordinator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator until interrupted.
    Run {
        /// Data directory (database, logs, fleetd.toml).
        #[arg(long, env = "FLEETD_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Log filter, e.g. "info" or "info,fleetd=debug".
        #[arg(long, env = "FLEETD_LOG")]
        log: Option<String>,
    },
    /// Print a one-shot snapshot (tasks by state, recent events, errors)
    /// as JSON and exit.
    Status {
        #[arg(long, env = "FLEETD_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { data_dir, log } => run(CoordinatorConfig::new(data_dir, log)).await,
        Command::Status { data_dir } => status(CoordinatorConfig::new(data_dir, None)).await,
    }
}

async fn run(config: CoordinatorConfig) -> Result<()> {
    // Console + daily-rolling file log under {data_dir}/logs.
    let file_appender =
        tracing_appender::rolling::daily(config.data_dir.join("logs"), "fleetd.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::new(config.log.clone()))
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().json().with_writer(file_writer))
        .init();

    tracing::info!(data_dir = %config.data_dir.display(), "fleetd starting");

    // The quota oracle is an external collaborator; without one configured
    // the static fail-open oracle answers green for every provider.
    let oracle = Arc::new(StaticOracle::new());
    let ctx = CoordinatorContext::init(config, oracle, VerifierRegistry::new()).await?;

    let (cancel_src, cancel) = CancelSource::new();
    let ticker = ctx.start_ticker(cancel);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    cancel_src.cancel();
    if let Err(e) = ticker.await {
        tracing::warn!(err = %e, "ticker join failed");
    }
    ctx.shutdown().await;
    tracing::info!("fleetd stopped");
    Ok(())
}

async fn status(config: CoordinatorConfig) -> Result<()> {
    let oracle = Arc::new(StaticOracle::new());
    let ctx = CoordinatorContext::init(config, oracle, VerifierRegistry::new()).await?;
    let snapshot = ctx.observatory.snapshot(50).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
