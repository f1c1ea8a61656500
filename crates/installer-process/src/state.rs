//! A single supervised child process
//!
//! [`State`] spawns a binary, gates readiness on an optional HTTP health
//! check, and stops it with a graceful signal that escalates to a forced kill
//! after the stop timeout. Exit of the child is observed by exactly one
//! waiter task, which records the status once and then publishes it.
//! Dropping a [`State`] whose process is still running kills its process
//! group.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProcessError, Result};
use crate::health::HealthCheck;
use crate::signal::{default_signaller, ProcessSignaller, SignalError};
use crate::ASSETS_DIR_ENV;

/// Start timeout used when none is configured
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(20);

/// Stop timeout used when none is configured
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Default)]
struct ExitState {
    exited: bool,
    error: Option<String>,
}

/// One supervised OS process
///
/// Configure the public fields, call [`State::init`], then
/// [`State::start`] and eventually [`State::stop`].
pub struct State {
    /// Binary to run; resolved from the name passed to `init` when empty
    pub path: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment as `KEY=VALUE`, layered over the inherited environment
    pub env: Vec<String>,
    /// Working directory; a temporary directory is created when unset
    pub dir: Option<PathBuf>,
    /// Readiness probe; without one the process is ready once spawned
    pub health_check: Option<HealthCheck>,
    /// How long `start` waits for readiness; zero means the default
    pub start_timeout: Duration,
    /// How long `stop` waits after the graceful signal; zero means the default
    pub stop_timeout: Duration,
    signaller: Arc<dyn ProcessSignaller>,
    ready: bool,
    pid: Option<u32>,
    exit: Arc<Mutex<ExitState>>,
    wait_done: Option<watch::Receiver<bool>>,
    kill: Option<CancellationToken>,
    owned_dir: Option<tempfile::TempDir>,
    poller_stops: Arc<AtomicUsize>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            args: Vec::new(),
            env: Vec::new(),
            dir: None,
            health_check: None,
            start_timeout: Duration::ZERO,
            stop_timeout: Duration::ZERO,
            signaller: default_signaller(),
            ready: false,
            pid: None,
            exit: Arc::new(Mutex::new(ExitState::default())),
            wait_done: None,
            kill: None,
            owned_dir: None,
            poller_stops: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("ready", &self.ready)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl State {
    /// Create an unconfigured process description
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the OS signaller
    pub fn with_signaller(mut self, signaller: Arc<dyn ProcessSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    /// Resolve the binary, fill default timeouts and ensure a working directory
    ///
    /// When `path` is empty, `name` is looked up in the assets directory named by
    /// `CAPI_INSTALLER_ASSETS` and then on `PATH`.
    pub fn init(&mut self, name: &str) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            if name.is_empty() {
                return Err(ProcessError::config("must have at least one of path or name"));
            }
            self.path = resolve_binary(name);
        }

        if self.start_timeout.is_zero() {
            self.start_timeout = DEFAULT_START_TIMEOUT;
        }
        if self.stop_timeout.is_zero() {
            self.stop_timeout = DEFAULT_STOP_TIMEOUT;
        }

        if self.dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix(&format!("{}-", self.binary_name()))
                .tempdir()
                .map_err(|e| ProcessError::config(format!("failed to create working dir: {e}")))?;
            self.dir = Some(dir.path().to_path_buf());
            self.owned_dir = Some(dir);
        }
        Ok(())
    }

    /// Spawn the process and wait until it is ready
    ///
    /// Idempotent once ready. Cancelling `cancel` kills the process.
    /// `stdout` and `stderr` receive the child's output streams.
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let binary = self.binary_name();

        let mut cmd = tokio::process::Command::new(&self.path);
        cmd.args(&self.args)
            .envs(self.env.iter().filter_map(|kv| kv.split_once('=')))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        self.pid = child.id();
        *self.exit.lock() = ExitState::default();
        debug!(binary = %binary, pid = ?self.pid, "started process");

        let (done_tx, mut done_rx) = watch::channel(false);
        self.wait_done = Some(done_rx.clone());
        let exit = Arc::clone(&self.exit);
        let kill = cancel.child_token();
        self.kill = Some(kill.clone());
        let signaller = Arc::clone(&self.signaller);
        let pid = self.pid;
        let waiter_binary = binary.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            let status = match status {
                Some(status) => status,
                None => {
                    let group_killed = pid.is_some_and(|pid| {
                        matches!(
                            signaller.signal_force(pid),
                            Ok(()) | Err(SignalError::NoSuchProcess(_))
                        )
                    });
                    if !group_killed {
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            };
            {
                let mut exit = exit.lock();
                exit.exited = true;
                exit.error = match status {
                    Ok(s) if s.success() => None,
                    Ok(s) => Some(s.to_string()),
                    Err(e) => Some(e.to_string()),
                };
            }
            debug!(binary = %waiter_binary, "process exited");
            let _ = done_tx.send(true);
        });

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let poller_stop = CancellationToken::new();
        match &self.health_check {
            Some(check) => {
                let check = check.clone();
                let stop = poller_stop.clone();
                let stops = Arc::clone(&self.poller_stops);
                tokio::spawn(async move {
                    if check.wait_ready(&stop).await {
                        let _ = ready_tx.send(());
                    } else {
                        stops.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            None => {
                let _ = ready_tx.send(());
            }
        }

        tokio::select! {
            biased;
            Ok(()) = ready_rx => {
                self.ready = true;
                info!(binary = %binary, "process ready");
                Ok(())
            }
            _ = done_rx.wait_for(|done| *done) => {
                poller_stop.cancel();
                let status = self
                    .exit
                    .lock()
                    .error
                    .clone()
                    .unwrap_or_else(|| "exit status: 0".to_string());
                Err(ProcessError::ExitedBeforeReady { binary, status })
            }
            _ = tokio::time::sleep(self.start_timeout) => {
                poller_stop.cancel();
                if let Some(pid) = self.pid {
                    let _ = self.signaller.signal_graceful(pid);
                }
                Err(ProcessError::StartTimeout {
                    binary,
                    timeout: self.start_timeout,
                })
            }
        }
    }

    /// Stop the process, escalating to a forced kill after the stop timeout
    ///
    /// A process that was never started is a no-op. A process that already
    /// exited is logged and treated as success.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let binary = self.binary_name();
        self.ready = false;

        let (exited, error) = self.exited();
        if exited {
            if let Some(err) = error {
                warn!(binary = %binary, error = %err, "process had already exited with an error");
            }
            self.pid = None;
            return Ok(());
        }

        match self.signaller.signal_graceful(pid) {
            Ok(()) | Err(SignalError::NoSuchProcess(_)) => {}
            Err(source) => return Err(ProcessError::Signal { binary, source }),
        }

        let timeout = if self.stop_timeout.is_zero() {
            DEFAULT_STOP_TIMEOUT
        } else {
            self.stop_timeout
        };
        let stopped = match self.wait_done.as_mut() {
            Some(done) => tokio::time::timeout(timeout, done.wait_for(|d| *d))
                .await
                .is_ok(),
            None => true,
        };

        if stopped {
            debug!(binary = %binary, "process stopped");
            self.pid = None;
            return Ok(());
        }

        warn!(binary = %binary, ?timeout, "process did not stop in time, killing");
        match self.signaller.signal_force(pid) {
            Ok(()) | Err(SignalError::NoSuchProcess(_)) => {}
            Err(source) => return Err(ProcessError::Signal { binary, source }),
        }
        if let Some(done) = self.wait_done.as_mut() {
            let _ = done.wait_for(|d| *d).await;
        }
        self.pid = None;
        Err(ProcessError::ForcedKill { binary, timeout })
    }

    /// Whether the process has exited, and its error if it failed
    pub fn exited(&self) -> (bool, Option<String>) {
        let exit = self.exit.lock();
        (exit.exited, exit.error.clone())
    }

    /// Whether `start` completed and the process has not been stopped
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// OS pid of the running process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Working directory in effect
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Count of health pollers that stopped without reporting ready
    pub fn poller_stop_signals(&self) -> usize {
        self.poller_stops.load(Ordering::SeqCst)
    }

    fn binary_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        if self.exit.lock().exited {
            return;
        }
        debug!(binary = %self.binary_name(), pid, "killing process of dropped state");
        let _ = self.signaller.signal_force(pid);
        if let Some(kill) = &self.kill {
            kill.cancel();
        }
    }
}

fn resolve_binary(name: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(ASSETS_DIR_ENV) {
        let candidate = Path::new(&dir).join(name);
        if candidate.is_file() {
            return candidate;
        }
    }
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}
