use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use leakwatch::collector::Collector;
use leakwatch::config::CollectorConfig;
use leakwatch::store::Store;
use leakwatch::{signal, version};

/// Central collector persisting leak reports to a document store.
#[derive(Parser)]
#[command(name = "leakwatch-collector", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("leakwatch-collector {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => CollectorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CollectorConfig::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting leakwatch collector",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: CollectorConfig) -> Result<()> {
    let store = Store::from_config(&cfg.store).context("initializing document store")?;

    let shutdown_rx = signal::shutdown_on_signal();

    let mut collector = Collector::new(cfg, store)?;
    collector.start().await?;

    let _ = shutdown_rx.await;

    collector.stop().await?;

    tracing::info!("leakwatch collector stopped");

    Ok(())
}
