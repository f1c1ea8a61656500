//! Admission webhook configurations pointed at locally running controllers
//!
//! In-cluster webhook configurations reference a Service. Locally there is no
//! Service, so each `clientConfig` is rewritten to a loopback URL on a port
//! allocated here, with a certificate issued by a throwaway CA.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use installer_common::kube_utils::{self, ManifestMetadata};
use installer_common::pki::CertificateAuthority;
use installer_common::yaml::read_manifest_documents;
use installer_process::ListenAddr;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::LOCAL_HOST;
use crate::error::{Error, Result};

const MUTATING_KIND: &str = "MutatingWebhookConfiguration";
const VALIDATING_KIND: &str = "ValidatingWebhookConfiguration";

/// How long `install` waits for every configuration to be visible
const INSTALL_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Webhook configurations for one controller and where they are served
#[derive(Debug, Default)]
pub struct WebhookInstallOptions {
    /// Files or directories holding webhook configuration manifests
    pub paths: Vec<PathBuf>,
    /// Host the controller serves webhooks on
    pub local_serving_host: String,
    /// Port the controller serves webhooks on; allocated when zero
    pub local_serving_port: u16,
    /// Directory holding `tls.crt` and `tls.key`; a temp dir when unset
    pub local_serving_cert_dir: Option<PathBuf>,
    /// CA certificate (PEM) that signed the serving certificate
    pub local_serving_ca_data: Vec<u8>,
    pub(super) mutating: Vec<Value>,
    pub(super) validating: Vec<Value>,
    pub(super) owned_cert_dir: Option<tempfile::TempDir>,
}

impl WebhookInstallOptions {
    /// Options reading configurations from `paths`
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            ..Self::default()
        }
    }

    /// Read configurations, allocate a port, issue certificates and rewrite
    /// every client config to the local serving URL
    pub fn prepare(&mut self) -> Result<()> {
        if self.local_serving_host.is_empty() {
            self.local_serving_host = LOCAL_HOST.to_string();
        }
        if self.local_serving_port == 0 {
            let addr = ListenAddr::suggest(&self.local_serving_host)?;
            self.local_serving_port = addr.port_number()?;
        }
        let cert_dir = match &self.local_serving_cert_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
                dir.clone()
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("envtest-serving-certs-")
                    .tempdir()
                    .map_err(|e| Error::io(std::env::temp_dir(), e))?;
                let path = dir.path().to_path_buf();
                self.owned_cert_dir = Some(dir);
                self.local_serving_cert_dir = Some(path.clone());
                path
            }
        };
        self.issue_serving_cert(&cert_dir)?;

        let documents = read_manifest_documents(&self.paths)?;
        let (mut mutating, mut validating) = (Vec::new(), Vec::new());
        for mut doc in documents {
            let kind = kube_utils::kind_of(&doc).to_string();
            match kind.as_str() {
                MUTATING_KIND => {
                    self.rewrite_client_configs(&mut doc)?;
                    mutating.push(doc);
                }
                VALIDATING_KIND => {
                    self.rewrite_client_configs(&mut doc)?;
                    validating.push(doc);
                }
                _ => {}
            }
        }
        debug!(
            mutating = mutating.len(),
            validating = validating.len(),
            port = self.local_serving_port,
            "prepared webhook configurations"
        );
        self.mutating = mutating;
        self.validating = validating;
        Ok(())
    }

    /// Apply the prepared configurations and wait until each exists
    pub async fn install(&self, client: &Client) -> Result<()> {
        let manifests = self
            .mutating
            .iter()
            .chain(&self.validating)
            .cloned()
            .map(ManifestMetadata::from_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if manifests.is_empty() {
            return Ok(());
        }

        for manifest in &manifests {
            kube_utils::apply_manifest(client, manifest)
                .await
                .map_err(|e| Error::Webhook(format!("{}: {e}", manifest.name)))?;
        }

        for manifest in &manifests {
            kube_utils::poll_until(
                INSTALL_TIMEOUT,
                INSTALL_POLL_INTERVAL,
                format!("webhook configuration {} was not created", manifest.name),
                || kube_utils::manifest_exists(client, manifest),
            )
            .await?;
        }
        info!(count = manifests.len(), "installed webhook configurations");
        Ok(())
    }

    /// `host:port` the controller must serve webhooks on
    pub fn serving_host_port(&self) -> String {
        ListenAddr::new(&self.local_serving_host, self.local_serving_port).host_port()
    }

    /// URL for a webhook path on the local serving address
    pub fn serving_url(&self, path: &str) -> String {
        format!(
            "https://{}/{}",
            self.serving_host_port(),
            path.trim_start_matches('/')
        )
    }

    /// Base64 CA bundle for client configs
    pub fn ca_bundle(&self) -> String {
        STANDARD.encode(&self.local_serving_ca_data)
    }

    /// Prepared mutating configurations
    pub fn mutating_webhooks(&self) -> &[Value] {
        &self.mutating
    }

    /// Prepared validating configurations
    pub fn validating_webhooks(&self) -> &[Value] {
        &self.validating
    }

    fn issue_serving_cert(&mut self, cert_dir: &Path) -> Result<()> {
        let ca = CertificateAuthority::new("envtest-webhook-ca")?;
        let serving = ca.generate_server_cert(&[self.local_serving_host.as_str(), "localhost"])?;
        for (name, contents) in [("tls.crt", &serving.cert_pem), ("tls.key", &serving.key_pem)] {
            let path = cert_dir.join(name);
            std::fs::write(&path, contents).map_err(|e| Error::io(&path, e))?;
        }
        self.local_serving_ca_data = ca.ca_cert_pem().as_bytes().to_vec();
        Ok(())
    }

    fn rewrite_client_configs(&self, doc: &mut Value) -> Result<()> {
        let Some(webhooks) = doc.get_mut("webhooks").and_then(Value::as_array_mut) else {
            return Ok(());
        };
        for webhook in webhooks {
            let path = webhook
                .pointer("/clientConfig/service/path")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string();
            let obj = webhook
                .as_object_mut()
                .ok_or_else(|| Error::Webhook("webhook entry is not an object".to_string()))?;
            obj.insert(
                "clientConfig".to_string(),
                json!({
                    "url": self.serving_url(&path),
                    "caBundle": self.ca_bundle(),
                }),
            );
        }
        Ok(())
    }
}
