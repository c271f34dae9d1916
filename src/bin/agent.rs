use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use leakwatch::config::AgentConfig;
use leakwatch::{host, version};

/// Per-host page-allocation leak agent.
#[derive(Parser)]
#[command(name = "leakwatch-agent", about)]
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
        println!("leakwatch-agent {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting leakwatch agent",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

#[cfg(feature = "bpf")]
async fn run(cfg: AgentConfig) -> Result<()> {
    use leakwatch::agent::Agent;
    use leakwatch::signal;
    use leakwatch::tracer::bpf::BpfAccumulator;

    let system_id = host::system_id(&cfg.system_id).context("resolving system identity")?;

    let accumulator = BpfAccumulator::load(&cfg.bpf).context("loading kernel instrumentation")?;
    let stats = accumulator.attachment_stats();

    let mut agent = Agent::new(cfg, system_id, accumulator)?;
    let health = agent.health();
    health
        .probes_attached
        .with_label_values(&["alloc"])
        .set(if stats.alloc_attached { 1.0 } else { 0.0 });
    health
        .probes_attached
        .with_label_values(&["free"])
        .set(if stats.free_attached { 1.0 } else { 0.0 });

    let shutdown_rx = signal::shutdown_on_signal();

    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("leakwatch agent stopped");

    Ok(())
}

#[cfg(not(feature = "bpf"))]
async fn run(cfg: AgentConfig) -> Result<()> {
    host::system_id(&cfg.system_id).context("resolving system identity")?;
    anyhow::bail!("leakwatch-agent was built without the `bpf` feature")
}
