//! Process supervision errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::signal::SignalError;

/// Result type for process supervision
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Errors from starting, probing or stopping a child process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process description is incomplete or inconsistent
    #[error("invalid process configuration: {0}")]
    Config(String),

    /// The binary could not be spawned
    #[error("failed to start {binary}: {source}")]
    Spawn {
        /// Base name of the binary
        binary: String,
        /// Underlying spawn error
        source: std::io::Error,
    },

    /// The health check never reported ready within the start timeout
    #[error("timeout waiting for process {binary} to start successfully (it may have failed to start, or stopped unexpectedly before becoming ready) after {timeout:?}")]
    StartTimeout {
        /// Base name of the binary
        binary: String,
        /// Configured start timeout
        timeout: Duration,
    },

    /// The process exited before it became ready
    #[error("process {binary} exited before becoming ready: {status}")]
    ExitedBeforeReady {
        /// Base name of the binary
        binary: String,
        /// Exit status or wait error
        status: String,
    },

    /// The process ignored the graceful signal and had to be killed
    #[error("timeout waiting for process {binary} to stop after {timeout:?}, sent kill signal")]
    ForcedKill {
        /// Base name of the binary
        binary: String,
        /// Configured stop timeout
        timeout: Duration,
    },

    /// A signal could not be delivered
    #[error("failed to signal process {binary}: {source}")]
    Signal {
        /// Base name of the binary
        binary: String,
        /// Underlying signal error
        source: SignalError,
    },

    /// `--help` could not be run to probe for a flag
    #[error("failed to probe {} for flag --{flag}: {message}", binary.display())]
    FlagProbe {
        /// Binary that was probed
        binary: PathBuf,
        /// Flag being looked for
        flag: String,
        /// What went wrong
        message: String,
    },
}

impl ProcessError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
