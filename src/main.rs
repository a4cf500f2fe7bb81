use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use logship::agent::Agent;
use logship::config::Config;

/// Ship event-log records to a search index in bulk.
#[derive(Parser)]
#[command(name = "logship", version, long_version = build_info(), about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn build_info() -> &'static str {
    Box::leak(
        format!(
            "{} ({}, {}/{})",
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_COMMIT").unwrap_or("unknown"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
        .into_boxed_str(),
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // The config file sets the log level; the flag overrides it only when
    // explicitly passed.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    init_tracing(level)?;

    tracing::info!(
        version = %build_info(),
        config = %cli.config.display(),
        "starting logship",
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cfg))
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    wait_for_shutdown().await;

    agent.stop().await?;
    tracing::info!("logship stopped");

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn wait_for_shutdown() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("registering SIGTERM handler");

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
