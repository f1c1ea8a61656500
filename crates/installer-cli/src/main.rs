//! Cluster API installer CLI
//!
//! Starts a throwaway control plane with the Cluster API controllers for the
//! configured platform.

use clap::Parser;
use installer_common::telemetry::{init_logging, LoggingConfig};
use tracing::error;

use installer_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LoggingConfig {
        default_directive: cli.log_level.clone(),
        ..LoggingConfig::default()
    }) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = cli.run().await {
        error!("{e}");
        std::process::exit(1);
    }
}
