//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    ClusterApi(#[from] installer_clusterapi::Error),

    #[error(transparent)]
    Common(#[from] installer_common::Error),

    #[error("logging setup failed: {0}")]
    Telemetry(#[from] installer_common::telemetry::TelemetryError),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no kubeconfig given; pass --kubeconfig or set KUBECONFIG")]
    MissingKubeconfig,

    #[error("unknown provider {name:?}")]
    UnknownProvider { name: String },

    #[error("machines failed: {}", names.join(", "))]
    MachinesFailed { names: Vec<String> },

    #[error("timed out after {seconds}s waiting for machines: {pending}")]
    MachinesTimedOut { seconds: u64, pending: String },

    #[error("path does not exist: {}", path.display())]
    MissingPath { path: PathBuf },

    #[error("local control plane is not running")]
    ControlPlaneNotRunning,

    #[error("interrupted")]
    Interrupted,
}
