use std::process::ExitCode;

use clap::Parser;
use seqcounter::{runtime, Config};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol, logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if let Err(err) = config.validate() {
        error!(error = %err, "refusing to start");
        return ExitCode::FAILURE;
    }

    let input = BufReader::new(tokio::io::stdin());
    match runtime::serve(&config, input, tokio::io::stdout()).await {
        Ok(report) if report.unapplied.is_empty() => ExitCode::SUCCESS,
        Ok(report) => {
            info!(unapplied = ?report.unapplied, "exiting with unapplied deltas");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "node failed");
            ExitCode::FAILURE
        }
    }
}
