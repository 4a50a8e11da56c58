//! baseboxd - OF-DPA switch control daemon
//!
//! Entry point for the baseboxd daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use baseboxd::{BaseboxConfig, DEFAULT_CONFIG_PATH};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Keeps an OF-DPA switch in sync with Linux kernel network state
#[derive(Parser, Debug)]
#[command(name = "baseboxd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// OpenFlow listen address, overrides the configuration file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Initializes tracing/logging subsystem
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = BaseboxConfig::load_or_default(&args.config)?;
    if let Some(listen) = args.listen {
        config.controller.listen_addr = listen;
    }
    info!(
        listen = %config.controller.listen_addr,
        ports = config.ports.len(),
        endpoints = config.endpoints.len(),
        "configuration loaded"
    );

    start(config).await
}

#[cfg(target_os = "linux")]
async fn start(config: BaseboxConfig) -> anyhow::Result<()> {
    baseboxd::daemon::run(config).await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn start(_config: BaseboxConfig) -> anyhow::Result<()> {
    anyhow::bail!("baseboxd requires Linux netlink and tap devices")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("baseboxd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("--- Starting baseboxd ---");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "baseboxd failed");
            ExitCode::FAILURE
        }
    }
}
