//! Error types for the cluster-api bootstrap

use std::path::PathBuf;

use installer_process::ProcessError;
use thiserror::Error;

/// Result type for the cluster-api bootstrap
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from extracting providers, running the control plane and
/// supervising controllers
#[derive(Debug, Error)]
pub enum Error {
    /// Shared helper failure (kube, YAML, PKI, polling)
    #[error(transparent)]
    Common(#[from] installer_common::Error),

    /// Child process supervision failure
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error with the path involved
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The embedded or supplied archive is unreadable
    #[error("archive error: {0}")]
    Archive(String),

    /// An archive entry would land outside the destination directory
    #[error("illegal file path in archive: {entry}")]
    PathTraversal {
        /// Offending entry name
        entry: String,
    },

    /// The install config names a platform with no controllers
    #[error("unsupported platform {0:?}")]
    UnsupportedPlatform(String),

    /// The install config could not be loaded
    #[error("invalid install config: {0}")]
    InstallConfig(String),

    /// Cloud credentials for a platform could not be resolved
    #[error("failed to load {platform} credentials: {message}")]
    Credentials {
        /// Platform whose credentials were requested
        platform: String,
        /// What went wrong
        message: String,
    },

    /// A controller argument template failed to render
    #[error("failed to render argument {arg:?}: {message}")]
    Template {
        /// Raw argument
        arg: String,
        /// Render error
        message: String,
    },

    /// Webhook configuration could not be prepared or installed
    #[error("webhook install failed: {0}")]
    Webhook(String),

    /// CRDs could not be installed or never became established
    #[error("CRD install failed: {0}")]
    Crd(String),

    /// Kubeconfig generation or serialization failed
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The local control plane failed to start or stop
    #[error("local control plane: {source}")]
    ControlPlane {
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A named controller failed to start
    #[error("failed to run controller {name:?}: {source}")]
    Controller {
        /// Controller name
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// `run` was called on a system that is running or torn down
    #[error("invalid system state: {0}")]
    State(String),
}

impl Error {
    /// Wrap an I/O error with its path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an archive error
    pub fn archive(msg: impl std::fmt::Display) -> Self {
        Self::Archive(msg.to_string())
    }

    /// Create a credentials error
    pub fn credentials(platform: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            platform: platform.into(),
            message: msg.into(),
        }
    }

    /// Attribute an error to the local control plane
    pub fn control_plane(source: impl Into<Error>) -> Self {
        Self::ControlPlane {
            source: Box::new(source.into()),
        }
    }

    /// Attribute an error to a named controller
    pub fn controller(name: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Controller {
            name: name.into(),
            source: Box::new(source.into()),
        }
    }
}
