use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stats_collector::{agent, config};
use tracing_subscriber::{fmt, EnvFilter};

/// Polls database introspection tables and forwards new intervals to logs or metrics.
#[derive(Parser)]
#[command(name = "stats-collector", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file's `log_level`.
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

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Commit hash from the `GIT_COMMIT` build environment, if set.
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{RELEASE} (commit: {}, {}/{})",
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("stats-collector {}", version::full());
        return Ok(());
    }

    // Config is required for the main collector run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        database = %cfg.database.database_path(),
        "starting stats-collector",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Start the agent.
    let mut agent = agent::Agent::new(&cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
    let signal =
        agent::wait_for_shutdown(tokio::signal::ctrl_c(), sigterm.as_mut().map(|s| s.recv()))
            .await;
    tracing::info!(signal, "received shutdown signal");

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("stats-collector stopped");

    Ok(())
}
