//! s3csv-target - load a tap's message stream into S3 as CSV

use anyhow::{Context, Result};
use clap::Parser;
use s3csv_common::logging::{init_logging, LogConfig, LogLevel};
use s3csv_target::config::TargetConfig;
use s3csv_target::retry::RetryingStore;
use s3csv_target::session::{abort_open_uploads, Session};
use s3csv_target::store::S3Store;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "s3csv-target")]
#[command(author, version, about = "Load a tap's message stream into S3 as CSV")]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Abort multipart uploads left open under the key prefix before loading
    #[arg(long)]
    abort_open_uploads: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("s3csv-target")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env().unwrap_or(log_config);

    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "Target failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => TargetConfig::from_file(path)?,
        None => TargetConfig::default(),
    }
    .with_env();

    // Nothing is read from stdin until the config is known to be usable
    config.ensure_valid()?;

    let store = Arc::new(RetryingStore::new(
        S3Store::from_config(&config).await,
        config.retry_policy(),
    ));

    if cli.abort_open_uploads {
        let aborted = abort_open_uploads(store.as_ref(), &config.object_key_prefix)
            .await
            .context("Failed to abort open uploads")?;
        info!("Aborted {} open uploads", aborted);
    }

    let mut session = Session::new(config, store, std::io::stdout());
    session
        .run(BufReader::new(tokio::io::stdin()))
        .await
        .context("Failed to load the message stream")?;

    debug!("Exiting normally");
    Ok(())
}
