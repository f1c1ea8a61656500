//! Delivery of stop signals to supervised processes
//!
//! POSIX systems get a graceful SIGTERM followed, if needed, by SIGKILL. Both
//! target the child's process group so helpers spawned by the child go too.
//! Platforms without a graceful signal kill on both calls.

use std::sync::Arc;

use thiserror::Error;

/// Errors from signal delivery
#[derive(Debug, Error)]
pub enum SignalError {
    /// The process (group) is already gone
    #[error("process {0} no longer exists")]
    NoSuchProcess(u32),

    /// The signal could not be delivered
    #[error("failed to signal process {pid}: {message}")]
    Failed {
        /// Target pid
        pid: u32,
        /// OS error text
        message: String,
    },
}

/// Sends graceful and forced stop requests to a process
pub trait ProcessSignaller: Send + Sync {
    /// Ask the process to shut down (SIGTERM on POSIX)
    fn signal_graceful(&self, pid: u32) -> Result<(), SignalError>;

    /// Terminate the process unconditionally (SIGKILL on POSIX)
    fn signal_force(&self, pid: u32) -> Result<(), SignalError>;
}

/// SIGTERM / SIGKILL delivered to the child's process group
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixSignaller;

#[cfg(unix)]
impl PosixSignaller {
    fn send(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), SignalError> {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| SignalError::Failed {
            pid,
            message: "pid out of range".to_string(),
        })?;
        match nix::sys::signal::killpg(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess(pid)),
            Err(e) => Err(SignalError::Failed {
                pid,
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(unix)]
impl ProcessSignaller for PosixSignaller {
    fn signal_graceful(&self, pid: u32) -> Result<(), SignalError> {
        Self::send(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn signal_force(&self, pid: u32) -> Result<(), SignalError> {
        Self::send(pid, nix::sys::signal::Signal::SIGKILL)
    }
}

/// Single forced kill for platforms without a graceful stop signal
#[derive(Debug, Default, Clone, Copy)]
pub struct ForceOnlySignaller;

impl ProcessSignaller for ForceOnlySignaller {
    fn signal_graceful(&self, pid: u32) -> Result<(), SignalError> {
        force_kill(pid)
    }

    fn signal_force(&self, pid: u32) -> Result<(), SignalError> {
        force_kill(pid)
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<(), SignalError> {
    PosixSignaller::send(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn force_kill(pid: u32) -> Result<(), SignalError> {
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .map_err(|e| SignalError::Failed {
            pid,
            message: e.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SignalError::Failed {
            pid,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// The signaller appropriate for the current OS
pub fn default_signaller() -> Arc<dyn ProcessSignaller> {
    #[cfg(unix)]
    {
        Arc::new(PosixSignaller)
    }
    #[cfg(not(unix))]
    {
        Arc::new(ForceOnlySignaller)
    }
}
