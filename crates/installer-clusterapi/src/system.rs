//! The local Cluster API system: control plane plus controllers
//!
//! `run` starts the control plane, then every controller for the platform in
//! order. A shutdown task, spawned as soon as the control plane is up, owns
//! the control plane and the started controllers. On cancellation it stops
//! the controllers in start order, then the control plane. `teardown`
//! triggers that task once and waits for it with a bound.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use installer_process::State;
use kube::Client;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control_plane::{ControlPlane, LocalControlPlane};
use crate::controllers::controllers_for;
use crate::error::{Error, Result};
use crate::install_config::InstallConfig;
use crate::launcher::{ControllerLauncher, LaunchContext, ProcessLauncher};
use crate::providers::ProviderArchive;
use crate::sessions::{CloudSessions, DefaultSessions};

/// Prefix of the temporary directory holding unpacked static manifests
pub const COMPONENTS_DIR_PREFIX: &str = "openshift-cluster-api-system-components";

/// Where the system keeps its files and how long teardown may take
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemConfig {
    /// Installer working directory
    pub dir: PathBuf,
    /// Directory binaries are extracted into; removed on teardown
    pub bin_dir: PathBuf,
    /// Directory receiving logs and the kubeconfig
    pub artifacts_dir: PathBuf,
    /// Upper bound on waiting for the shutdown task
    pub teardown_timeout: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::for_dir(".")
    }
}

impl SystemConfig {
    /// Layout rooted at the installer working directory
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            bin_dir: dir.join("cluster-api"),
            artifacts_dir: dir.join(".clusterapi_output"),
            teardown_timeout: Duration::from_secs(60),
            dir,
        }
    }
}

type StartedControllers = Arc<tokio::sync::Mutex<Vec<(String, State)>>>;

/// A local control plane and the controllers running against it
pub struct System {
    config: SystemConfig,
    bin_dir: PathBuf,
    control_plane: Option<Box<dyn ControlPlane>>,
    launcher: Arc<dyn ControllerLauncher>,
    sessions: Arc<dyn CloudSessions>,
    manifests: ProviderArchive,
    cancel: CancellationToken,
    client: Option<Client>,
    kubeconfig_path: Option<PathBuf>,
    started: bool,
    shutdown: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    components_dir: Mutex<Option<tempfile::TempDir>>,
    teardown_once: OnceCell<()>,
}

impl System {
    /// A system using the embedded archives and the local control plane
    pub fn new(config: SystemConfig) -> Result<Self> {
        let providers = ProviderArchive::embedded()?;
        let control_plane =
            LocalControlPlane::new(&config.bin_dir, &config.artifacts_dir, providers.clone());
        Ok(Self {
            bin_dir: config.bin_dir.clone(),
            control_plane: Some(Box::new(control_plane)),
            launcher: Arc::new(ProcessLauncher::new(providers)),
            sessions: Arc::new(DefaultSessions::new()),
            manifests: ProviderArchive::embedded_manifests()?,
            cancel: CancellationToken::new(),
            client: None,
            kubeconfig_path: None,
            started: false,
            shutdown: tokio::sync::Mutex::new(None),
            components_dir: Mutex::new(None),
            teardown_once: OnceCell::new(),
            config,
        })
    }

    /// Replace the control plane
    pub fn with_control_plane(mut self, control_plane: impl ControlPlane + 'static) -> Self {
        self.bin_dir = control_plane.bin_dir();
        self.control_plane = Some(Box::new(control_plane));
        self
    }

    /// Replace how controllers are started
    pub fn with_launcher(mut self, launcher: impl ControllerLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    /// Replace how cloud credentials are resolved
    pub fn with_sessions(mut self, sessions: impl CloudSessions + 'static) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    /// Replace the static manifests bundle
    pub fn with_manifests(mut self, manifests: ProviderArchive) -> Self {
        self.manifests = manifests;
        self
    }

    /// Start the control plane and every controller for the install config
    ///
    /// The controller list is resolved first, so configuration errors such as
    /// an unsupported platform fail before any process is spawned. On a later
    /// error, whatever was started stays owned by the shutdown task; call
    /// [`System::teardown`] to stop it.
    pub async fn run(&mut self, install_config: &InstallConfig) -> Result<()> {
        if self.teardown_once.initialized() {
            return Err(Error::State("system has been torn down".to_string()));
        }
        if self.started {
            return Err(Error::State("system is already running".to_string()));
        }
        if self.control_plane.is_none() {
            return Err(Error::State("no control plane configured".to_string()));
        }
        self.started = true;

        let components_dir = tempfile::Builder::new()
            .prefix(COMPONENTS_DIR_PREFIX)
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let components_path = components_dir.path().to_path_buf();
        *self.components_dir.lock() = Some(components_dir);
        self.manifests.extract_all(&components_path)?;

        let controllers =
            controllers_for(install_config, &components_path, self.sessions.as_ref()).await?;

        let mut control_plane = self
            .control_plane
            .take()
            .ok_or_else(|| Error::State("no control plane configured".to_string()))?;
        control_plane.run().await.map_err(Error::control_plane)?;
        let client = control_plane.client();
        let kubeconfig_path = control_plane
            .kubeconfig_path()
            .unwrap_or_else(|| self.config.artifacts_dir.join(crate::control_plane::KUBECONFIG_FILE));

        // held until every start has resolved so shutdown never overlaps one
        let started: StartedControllers = Arc::default();
        let mut started_guard = Arc::clone(&started).lock_owned().await;
        let process_cancel = CancellationToken::new();
        *self.shutdown.lock().await = Some(tokio::spawn(shutdown_task(
            self.cancel.clone(),
            process_cancel.clone(),
            control_plane,
            started,
        )));

        let ctx = LaunchContext {
            client: client.clone(),
            kubeconfig_path: kubeconfig_path.clone(),
            bin_dir: self.bin_dir.clone(),
            artifacts_dir: self.config.artifacts_dir.clone(),
            cancel: process_cancel,
        };
        for controller in &controllers {
            info!(controller = %controller.name, "running controller");
            let process = self
                .launcher
                .launch(controller, &ctx)
                .await
                .map_err(|e| Error::controller(&controller.name, e))?;
            started_guard.push((controller.name.clone(), process));
        }
        drop(started_guard);

        self.client = client;
        self.kubeconfig_path = Some(kubeconfig_path);
        info!(controllers = controllers.len(), "local cluster API system is ready");
        Ok(())
    }

    /// Stop every controller and the control plane
    ///
    /// Safe to call more than once and concurrently; only the first call
    /// does the work and later calls wait for it.
    pub async fn teardown(&self) {
        self.teardown_once
            .get_or_init(|| async {
                info!("shutting down local cluster API system");
                self.cancel.cancel();

                let handle = self.shutdown.lock().await.take();
                if let Some(handle) = handle {
                    match tokio::time::timeout(self.config.teardown_timeout, handle).await {
                        Ok(Ok(())) => info!("local cluster API system has completed operations"),
                        Ok(Err(e)) => warn!(error = %e, "shutdown task failed"),
                        Err(_) => warn!(
                            timeout = ?self.config.teardown_timeout,
                            "timed out waiting for local cluster API system to shut down"
                        ),
                    }
                }

                let components_dir = self.components_dir.lock().take();
                if let Some(dir) = components_dir {
                    if let Err(e) = dir.close() {
                        warn!(error = %e, "failed to remove manifests directory");
                    }
                }
                remove_dir(&self.bin_dir);
            })
            .await;
    }

    /// Client for the local control plane, once `run` has succeeded
    pub fn client(&self) -> Option<Client> {
        self.client.clone()
    }

    /// Kubeconfig of the local control plane, once `run` has succeeded
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.as_deref()
    }

    /// Directory binaries are extracted into
    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}

async fn shutdown_task(
    cancel: CancellationToken,
    process_cancel: CancellationToken,
    mut control_plane: Box<dyn ControlPlane>,
    started: StartedControllers,
) {
    cancel.cancelled().await;

    let mut started = started.lock().await;
    for (name, process) in started.iter_mut() {
        info!(controller = %name, "stopping controller");
        if let Err(e) = process.stop().await {
            warn!(controller = %name, error = %e, "failed to stop controller");
        }
    }
    process_cancel.cancel();

    if let Err(e) = control_plane.stop().await {
        warn!(error = %e, "failed to stop local control plane");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_layout_is_rooted_at_dir() {
        let config = SystemConfig::for_dir("/install");
        assert_eq!(config.bin_dir, PathBuf::from("/install/cluster-api"));
        assert_eq!(config.artifacts_dir, PathBuf::from("/install/.clusterapi_output"));
        assert_eq!(config.teardown_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn teardown_without_run_removes_bin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemConfig::for_dir(dir.path());
        std::fs::create_dir_all(&config.bin_dir).unwrap();
        let system = System::new(config.clone()).unwrap();

        system.teardown().await;
        system.teardown().await;
        assert!(!config.bin_dir.exists());
    }
}
