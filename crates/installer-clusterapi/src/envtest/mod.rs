//! Ephemeral etcd + kube-apiserver pair
//!
//! Both servers run as supervised child processes bound to loopback. The API
//! server is secured with a throwaway CA; the returned [`RestConfig`]
//! authenticates as a `system:masters` client certificate.

mod crd;
mod scheme;
mod webhook;

pub use crd::{install_crds, CrdInstallOptions};
pub use scheme::Scheme;
pub use webhook::WebhookInstallOptions;

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use installer_common::pki::{generate_private_key_pem, CertificateAuthority};
use installer_process::{HealthCheck, ListenAddr, State};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Loopback host every local server binds to
pub const LOCAL_HOST: &str = "127.0.0.1";

/// User the admin client certificate authenticates as
const ADMIN_USER: &str = "admin";
const ADMIN_GROUP: &str = "system:masters";

/// Connection details for the local API server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestConfig {
    /// `https://host:port`
    pub host: String,
    /// CA certificate, PEM
    pub ca_data: Vec<u8>,
    /// Client certificate, PEM
    pub cert_data: Vec<u8>,
    /// Client key, PEM
    pub key_data: Vec<u8>,
    /// Authenticated user name
    pub username: String,
}

/// An etcd and kube-apiserver pair managed as child processes
pub struct TestEnvironment {
    /// Directory holding the `etcd` and `kube-apiserver` binaries
    pub bin_dir: PathBuf,
    /// Start timeout applied to each server
    pub start_timeout: Duration,
    /// Stop timeout applied to each server
    pub stop_timeout: Duration,
    /// Extra `--key=value` flags for kube-apiserver, overriding defaults
    pub api_server_extra_args: BTreeMap<String, String>,
    /// Receives etcd output; discarded when unset
    pub etcd_output: Option<File>,
    /// Receives kube-apiserver output; discarded when unset
    pub api_server_output: Option<File>,
    etcd: Option<State>,
    api_server: Option<State>,
    work_dir: Option<tempfile::TempDir>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("bin_dir", &self.bin_dir)
            .field("start_timeout", &self.start_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .field("running", &self.api_server.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TestEnvironment {
    /// Describe an environment using binaries from `bin_dir`
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            api_server_extra_args: BTreeMap::new(),
            etcd_output: None,
            api_server_output: None,
            etcd: None,
            api_server: None,
            work_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Start etcd, then kube-apiserver, and return how to reach the latter
    ///
    /// On failure anything already started is stopped again.
    pub async fn start(&mut self) -> Result<RestConfig> {
        match self.start_servers().await {
            Ok(config) => Ok(config),
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    warn!(error = %stop_err, "failed to clean up after start failure");
                }
                Err(e)
            }
        }
    }

    async fn start_servers(&mut self) -> Result<RestConfig> {
        let work_dir = tempfile::Builder::new()
            .prefix("envtest-")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let root = work_dir.path().to_path_buf();
        self.work_dir = Some(work_dir);
        let cert_dir = root.join("certs");
        let data_dir = root.join("etcd");
        for dir in [&cert_dir, &data_dir] {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let client_addr = ListenAddr::suggest(LOCAL_HOST)?;
        let peer_addr = ListenAddr::suggest(LOCAL_HOST)?;
        let etcd_url = format!("http://{}", client_addr.host_port());

        let mut etcd = self.process("etcd", root);
        etcd.args = etcd_args(&data_dir, &client_addr, &peer_addr);
        etcd.health_check = Some(HealthCheck::new(client_addr.url("http", "/health")?));
        etcd.init("etcd")?;
        info!(url = %etcd_url, "starting etcd");
        let result = etcd
            .start(&self.cancel, stdio(&self.etcd_output), stdio(&self.etcd_output))
            .await;
        self.etcd = Some(etcd);
        result?;

        self.start_api_server(&cert_dir, &etcd_url).await
    }

    async fn start_api_server(&mut self, cert_dir: &Path, etcd_url: &str) -> Result<RestConfig> {
        let secure_addr = ListenAddr::suggest(LOCAL_HOST)?;
        let host = format!("https://{}", secure_addr.host_port());

        let ca = CertificateAuthority::new("envtest-ca")?;
        let serving = ca.generate_server_cert(&["localhost", LOCAL_HOST])?;
        let admin = ca.generate_client_cert(ADMIN_USER, Some(ADMIN_GROUP))?;
        let sa_key = generate_private_key_pem()?;

        let files = [
            ("ca.crt", ca.ca_cert_pem()),
            ("apiserver.crt", serving.cert_pem.as_str()),
            ("apiserver.key", serving.key_pem.as_str()),
            ("sa-signer.key", sa_key.as_str()),
        ];
        for (name, contents) in files {
            let path = cert_dir.join(name);
            std::fs::write(&path, contents).map_err(|e| Error::io(&path, e))?;
        }

        let mut flags = api_server_flags(cert_dir, &secure_addr, etcd_url, &host);
        flags.extend(self.api_server_extra_args.clone());

        let mut api_server = self.process("kube-apiserver", cert_dir.to_path_buf());
        api_server.args = flags
            .into_iter()
            .map(|(k, v)| format!("--{k}={v}"))
            .collect();
        api_server.health_check = Some(HealthCheck::new(secure_addr.url("https", "/healthz")?));
        api_server.init("kube-apiserver")?;
        info!(url = %host, "starting kube-apiserver");
        let result = api_server
            .start(
                &self.cancel,
                stdio(&self.api_server_output),
                stdio(&self.api_server_output),
            )
            .await;
        self.api_server = Some(api_server);
        result?;

        Ok(RestConfig {
            host,
            ca_data: ca.ca_cert_pem().as_bytes().to_vec(),
            cert_data: admin.cert_pem.into_bytes(),
            key_data: admin.key_pem.into_bytes(),
            username: ADMIN_USER.to_string(),
        })
    }

    /// Stop kube-apiserver, then etcd, and remove their working files
    ///
    /// Both are always attempted; the first error is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;
        for (name, process) in [
            ("kube-apiserver", self.api_server.take()),
            ("etcd", self.etcd.take()),
        ] {
            let Some(mut process) = process else {
                continue;
            };
            if let Err(e) = process.stop().await {
                warn!(process = name, error = %e, "failed to stop");
                first_err.get_or_insert(e.into());
            }
        }
        if let Some(dir) = self.work_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                first_err.get_or_insert(Error::io(path, e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn process(&self, binary: &str, dir: PathBuf) -> State {
        let mut state = State::new();
        let candidate = self.bin_dir.join(binary);
        if candidate.is_file() {
            state.path = candidate;
        }
        state.dir = Some(dir);
        state.start_timeout = self.start_timeout;
        state.stop_timeout = self.stop_timeout;
        state
    }
}

fn stdio(file: &Option<File>) -> Stdio {
    file.as_ref()
        .and_then(|f| f.try_clone().ok())
        .map(Stdio::from)
        .unwrap_or_else(Stdio::null)
}

fn etcd_args(data_dir: &Path, client: &ListenAddr, peer: &ListenAddr) -> Vec<String> {
    let client_url = format!("http://{}", client.host_port());
    let peer_url = format!("http://{}", peer.host_port());
    vec![
        format!("--data-dir={}", data_dir.display()),
        format!("--listen-client-urls={client_url}"),
        format!("--advertise-client-urls={client_url}"),
        format!("--listen-peer-urls={peer_url}"),
        format!("--initial-advertise-peer-urls={peer_url}"),
        format!("--initial-cluster=default={peer_url}"),
        "--name=default".to_string(),
        "--unsafe-no-fsync=true".to_string(),
    ]
}

fn api_server_flags(
    cert_dir: &Path,
    secure: &ListenAddr,
    etcd_url: &str,
    host: &str,
) -> BTreeMap<String, String> {
    let cert = |name: &str| cert_dir.join(name).display().to_string();
    [
        ("advertise-address", LOCAL_HOST.to_string()),
        ("bind-address", secure.address.clone()),
        ("secure-port", secure.port.clone()),
        ("etcd-servers", etcd_url.to_string()),
        ("cert-dir", cert_dir.display().to_string()),
        ("tls-cert-file", cert("apiserver.crt")),
        ("tls-private-key-file", cert("apiserver.key")),
        ("client-ca-file", cert("ca.crt")),
        ("service-account-key-file", cert("sa-signer.key")),
        ("service-account-signing-key-file", cert("sa-signer.key")),
        ("service-account-issuer", host.to_string()),
        ("service-cluster-ip-range", "10.0.0.0/24".to_string()),
        ("authorization-mode", "RBAC".to_string()),
        ("allow-privileged", "true".to_string()),
        ("disable-admission-plugins", "ServiceAccount".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_server_flags_point_at_cert_dir() {
        let flags = api_server_flags(
            Path::new("/work/certs"),
            &ListenAddr::new(LOCAL_HOST, 6443),
            "http://127.0.0.1:2379",
            "https://127.0.0.1:6443",
        );
        assert_eq!(flags["secure-port"], "6443");
        assert_eq!(flags["tls-cert-file"], "/work/certs/apiserver.crt");
        assert_eq!(flags["etcd-servers"], "http://127.0.0.1:2379");
        assert_eq!(flags["service-account-key-file"], flags["service-account-signing-key-file"]);
    }

    #[test]
    fn extra_args_override_defaults() {
        let mut flags = api_server_flags(
            Path::new("/certs"),
            &ListenAddr::new(LOCAL_HOST, 1),
            "http://127.0.0.1:2",
            "https://127.0.0.1:1",
        );
        flags.extend([("authorization-mode".to_string(), "AlwaysAllow".to_string())]);
        assert_eq!(flags["authorization-mode"], "AlwaysAllow");
    }

    #[test]
    fn etcd_listens_on_both_ports() {
        let args = etcd_args(
            Path::new("/data"),
            &ListenAddr::new(LOCAL_HOST, 2379),
            &ListenAddr::new(LOCAL_HOST, 2380),
        );
        assert!(args.contains(&"--listen-client-urls=http://127.0.0.1:2379".to_string()));
        assert!(args.contains(&"--listen-peer-urls=http://127.0.0.1:2380".to_string()));
        assert!(args.contains(&"--data-dir=/data".to_string()));
    }

    #[tokio::test]
    async fn stop_before_start_is_ok() {
        let mut env = TestEnvironment::new("/nonexistent");
        env.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binaries_fail_start_and_clean_up() {
        let bin_dir = tempfile::tempdir().unwrap();
        let mut env = TestEnvironment::new(bin_dir.path());
        env.start_timeout = Duration::from_millis(200);
        std::fs::write(bin_dir.path().join("etcd"), "not a binary").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                bin_dir.path().join("etcd"),
                std::fs::Permissions::from_mode(0o644),
            )
            .unwrap();
        }

        assert!(env.start().await.is_err());
        assert!(env.work_dir.is_none());
    }
}
