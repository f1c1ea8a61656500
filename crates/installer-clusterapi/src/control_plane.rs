//! The local control plane every controller talks to

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use installer_common::kube_utils;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::envtest::{RestConfig, TestEnvironment};
use crate::error::{Error, Result};
use crate::kubeconfig::Kubeconfig;
use crate::providers::{self, ProviderArchive};

/// Start timeout for etcd and kube-apiserver
pub const CONTROL_PLANE_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Stop timeout for etcd and kube-apiserver
pub const CONTROL_PLANE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Kubeconfig file name inside the artifacts directory
pub const KUBECONFIG_FILE: &str = "envtest.kubeconfig";
/// etcd log file name inside the artifacts directory
pub const ETCD_LOG_FILE: &str = "etcd.log";
/// kube-apiserver log file name inside the artifacts directory
pub const API_SERVER_LOG_FILE: &str = "kube-apiserver.log";

/// An API server the orchestrator can start controllers against
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start the control plane and produce a kubeconfig and client
    async fn run(&mut self) -> Result<()>;

    /// Stop the control plane
    async fn stop(&mut self) -> Result<()>;

    /// Client bound to the running control plane
    fn client(&self) -> Option<Client>;

    /// Absolute path of the generated kubeconfig
    fn kubeconfig_path(&self) -> Option<PathBuf>;

    /// Directory binaries are extracted into
    fn bin_dir(&self) -> PathBuf;
}

/// etcd + kube-apiserver on loopback, with binaries from the provider archive
pub struct LocalControlPlane {
    bin_dir: PathBuf,
    artifacts_dir: PathBuf,
    archive: ProviderArchive,
    api_server_extra_args: BTreeMap<String, String>,
    env: Option<TestEnvironment>,
    rest_config: Option<RestConfig>,
    kubeconfig_path: Option<PathBuf>,
    client: Option<Client>,
}

impl std::fmt::Debug for LocalControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalControlPlane")
            .field("bin_dir", &self.bin_dir)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("kubeconfig_path", &self.kubeconfig_path)
            .finish_non_exhaustive()
    }
}

impl LocalControlPlane {
    /// A control plane extracting into `bin_dir` and logging into `artifacts_dir`
    pub fn new(
        bin_dir: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
        archive: ProviderArchive,
    ) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            artifacts_dir: artifacts_dir.into(),
            archive,
            api_server_extra_args: BTreeMap::new(),
            env: None,
            rest_config: None,
            kubeconfig_path: None,
            client: None,
        }
    }

    /// Pass an extra `--key=value` flag to kube-apiserver
    pub fn with_api_server_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.api_server_extra_args.insert(key.into(), value.into());
        self
    }

    /// REST config of the running API server
    pub fn rest_config(&self) -> Option<&RestConfig> {
        self.rest_config.as_ref()
    }
}

impl LocalControlPlane {
    /// Publish the kubeconfig and connect; a started `env` is stopped on failure
    async fn finish_start(&mut self, mut env: TestEnvironment, rest_config: RestConfig) -> Result<()> {
        match self.connect(&rest_config).await {
            Ok((path, client)) => {
                info!(kubeconfig = %path.display(), "local control plane running");
                self.env = Some(env);
                self.client = Some(client);
                self.kubeconfig_path = Some(path);
                self.rest_config = Some(rest_config);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = env.stop().await {
                    warn!(error = %stop_err, "failed to stop local control plane after start failure");
                }
                Err(e)
            }
        }
    }

    async fn connect(&self, rest_config: &RestConfig) -> Result<(PathBuf, Client)> {
        let path = self.artifacts_dir.join(KUBECONFIG_FILE);
        Kubeconfig::from_rest_config(rest_config).write(&path)?;
        let path = std::path::absolute(&path).map_err(|e| Error::io(&path, e))?;
        let client = kube_utils::create_client(&path).await?;
        Ok((path, client))
    }
}

fn log_file(dir: &Path, name: &str) -> Result<File> {
    let path = dir.join(name);
    File::create(&path).map_err(|e| Error::io(path, e))
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn run(&mut self) -> Result<()> {
        self.archive.extract(&providers::CLUSTER_API, &self.bin_dir)?;
        self.archive.extract(&providers::ENVTEST, &self.bin_dir)?;

        std::fs::create_dir_all(&self.artifacts_dir)
            .map_err(|e| Error::io(&self.artifacts_dir, e))?;

        let mut env = TestEnvironment::new(&self.bin_dir);
        env.start_timeout = CONTROL_PLANE_START_TIMEOUT;
        env.stop_timeout = CONTROL_PLANE_STOP_TIMEOUT;
        env.api_server_extra_args = self.api_server_extra_args.clone();
        env.etcd_output = Some(log_file(&self.artifacts_dir, ETCD_LOG_FILE)?);
        env.api_server_output = Some(log_file(&self.artifacts_dir, API_SERVER_LOG_FILE)?);

        info!("starting local control plane");
        let rest_config = env.start().await?;
        self.finish_start(env, rest_config).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.client = None;
        match self.env.take() {
            Some(mut env) => {
                info!("stopping local control plane");
                env.stop().await
            }
            None => Ok(()),
        }
    }

    fn client(&self) -> Option<Client> {
        self.client.clone()
    }

    fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig_path.clone()
    }

    fn bin_dir(&self) -> PathBuf {
        self.bin_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_run_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = LocalControlPlane::new(
            dir.path().join("bin"),
            dir.path().join("artifacts"),
            ProviderArchive::embedded().unwrap(),
        );
        cp.stop().await.unwrap();
        assert!(cp.client().is_none());
        assert!(cp.kubeconfig_path().is_none());
        assert_eq!(cp.bin_dir(), dir.path().join("bin"));
    }

    #[tokio::test]
    async fn failed_connect_releases_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("artifacts");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut cp = LocalControlPlane::new(
            dir.path().join("bin"),
            &blocker,
            ProviderArchive::embedded().unwrap(),
        );
        let rest_config = RestConfig {
            host: "https://127.0.0.1:6443".to_string(),
            ..RestConfig::default()
        };

        let result = cp
            .finish_start(TestEnvironment::new(dir.path().join("bin")), rest_config)
            .await;

        assert!(result.is_err());
        assert!(cp.env.is_none());
        assert!(cp.client().is_none());
        assert!(cp.kubeconfig_path().is_none());
        assert!(cp.rest_config().is_none());
    }

    #[test]
    fn extra_api_server_args_accumulate() {
        let cp = LocalControlPlane::new("/bin-dir", "/artifacts", ProviderArchive::embedded().unwrap())
            .with_api_server_arg("feature-gates", "A=true")
            .with_api_server_arg("v", "4");
        assert_eq!(cp.api_server_extra_args.len(), 2);
        assert_eq!(cp.api_server_extra_args["v"], "4");
    }
}
