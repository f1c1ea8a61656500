//! Child process supervision for the local Cluster API control plane
//!
//! This crate provides:
//! - [`State`]: one supervised OS process with start/stop timeouts, an optional
//!   HTTP health check gating readiness, and SIGTERM→SIGKILL escalation
//! - [`HealthCheck`] and [`ListenAddr`]: where and how readiness is probed
//! - [`ProcessSignaller`]: the OS-specific way graceful and forced stops are sent
//! - [`check_flag`]: feature detection of optional command-line flags

pub mod error;
pub mod flags;
pub mod health;
pub mod listen;
pub mod signal;
pub mod state;

pub use error::{ProcessError, Result};
pub use flags::check_flag;
pub use health::{HealthCheck, DEFAULT_POLL_INTERVAL};
pub use listen::ListenAddr;
pub use signal::{default_signaller, ForceOnlySignaller, ProcessSignaller, SignalError};
#[cfg(unix)]
pub use signal::PosixSignaller;
pub use state::{State, DEFAULT_START_TIMEOUT, DEFAULT_STOP_TIMEOUT};

/// Environment variable naming a directory searched for binaries before `PATH`
pub const ASSETS_DIR_ENV: &str = "CAPI_INSTALLER_ASSETS";
