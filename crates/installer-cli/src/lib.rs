//! Cluster API installer CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bootstrap a local Cluster API control plane and drive machines with it
#[derive(Parser, Debug)]
#[command(name = "capi-installer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Kubeconfig of an existing cluster
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info", env = "CAPI_INSTALLER_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the local control plane and controllers until interrupted
    Run(commands::run::RunArgs),
    /// Create machines through the local control plane and wait for them
    AddNodes(commands::add_nodes::AddNodesArgs),
    /// Watch machines on an existing cluster until they are running
    MonitorAddNodes(commands::monitor::MonitorArgs),
    /// Extract a provider's binaries
    Extract(commands::extract::ExtractArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::AddNodes(args) => commands::add_nodes::run(args).await,
            Commands::MonitorAddNodes(args) => {
                let kubeconfig = self.kubeconfig.ok_or(Error::MissingKubeconfig)?;
                commands::monitor::run(args, &kubeconfig).await
            }
            Commands::Extract(args) => commands::extract::run(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["capi-installer", "run"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.dir, PathBuf::from("."));
                assert_eq!(args.install_config, PathBuf::from("install-config.yaml"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "capi-installer",
            "monitor-add-nodes",
            "--timeout",
            "5m",
            "--kubeconfig",
            "/tmp/kc",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.kubeconfig, Some(PathBuf::from("/tmp/kc")));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::MonitorAddNodes(args) => assert_eq!(args.timeout, Duration::from_secs(300)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn add_nodes_takes_manifests_and_timeout() {
        let cli =
            Cli::try_parse_from(["capi-installer", "add-nodes", "--manifests", "machines/"]).unwrap();
        match cli.command {
            Commands::AddNodes(args) => {
                assert_eq!(args.manifests, Some(PathBuf::from("machines/")));
                assert_eq!(args.timeout, Duration::from_secs(1800));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_timeout() {
        assert!(
            Cli::try_parse_from(["capi-installer", "monitor-add-nodes", "--timeout", "soon"]).is_err()
        );
    }
}
