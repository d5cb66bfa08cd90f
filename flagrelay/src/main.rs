use clap::Parser;
use relay::config::{Config, ConfigError};
use std::future::Future;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Multi-tenant streaming relay for a feature-flag service.
#[derive(Parser)]
#[command(name = "flagrelay", version)]
struct Cli {
    /// Configuration file location
    #[arg(long, default_value = "/etc/flagrelay.conf")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let args = Cli::parse();

    tracing::info!(config = %args.config.display(), "Starting flagrelay");

    let config = Config::load(&args.config, std::env::vars())?;

    run_async(relay::run(config))
}

fn run_async(fut: impl Future<Output = Result<(), relay::errors::RelayError>>) -> Result<(), CliError> {
    // One task per connection, environment supervisor and stream reader.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
