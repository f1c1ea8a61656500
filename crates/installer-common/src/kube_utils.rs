//! Shared Kubernetes utilities using kube-rs
//!
//! Manifests are applied with server-side apply through dynamic objects so
//! that arbitrary provider components (CRDs, webhook configurations,
//! namespaces) can be installed without typed bindings.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::Value;
use tracing::trace;

use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients (5s is plenty for local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until a condition is met or timeout is reached
///
/// Calls `check_fn` every `poll_interval` until it returns `Ok(true)`.
/// Errors from the check are treated as "not yet" and logged at trace level,
/// since the API server may still be settling.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::timeout(timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!("Polling condition not yet met, retrying...");
            }
            Err(e) => {
                trace!("Polling check returned error (retrying): {}", e);
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to read kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: Value,
    /// Resource name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

impl ManifestMetadata {
    /// Extract apiVersion, kind, name and namespace from a manifest document
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?
            .to_string();

        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization("manifest missing kind"))?
            .to_string();

        let name = value
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::serialization_for_kind(&kind, "manifest missing metadata.name"))?
            .to_string();

        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let api_resource = build_api_resource(&api_version, &kind);

        Ok(Self {
            value,
            name,
            namespace,
            api_resource,
        })
    }

    /// Dynamic API handle scoped the way this manifest is scoped
    pub fn api(&self, client: &Client) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &self.api_resource),
            None => Api::all_with(client.clone(), &self.api_resource),
        }
    }
}

/// Return the `kind` of a manifest document, or an empty string
pub fn kind_of(value: &Value) -> &str {
    value.get("kind").and_then(|v| v.as_str()).unwrap_or("")
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use installer_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("cluster.x-k8s.io/v1beta1");
/// assert_eq!(group, "cluster.x-k8s.io");
/// assert_eq!(version, "v1beta1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind taken from a manifest
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Known plural forms that simple English rules get wrong
const KIND_PLURALS: &[(&str, &str)] = &[
    ("customresourcedefinition", "customresourcedefinitions"),
    ("mutatingwebhookconfiguration", "mutatingwebhookconfigurations"),
    ("validatingwebhookconfiguration", "validatingwebhookconfigurations"),
    ("clusterclass", "clusterclasses"),
    ("ipaddress", "ipaddresses"),
    ("machinepolicy", "machinepolicies"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Apply a parsed manifest using server-side apply
pub async fn apply_manifest(client: &Client, manifest: &ManifestMetadata) -> Result<(), Error> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    manifest
        .api(client)
        .patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "apply_manifest",
                format!(
                    "failed to apply {}/{}: {}",
                    manifest.api_resource.kind, manifest.name, e
                ),
            )
        })?;
    Ok(())
}

/// Check whether the object described by a manifest exists on the server
pub async fn manifest_exists(client: &Client, manifest: &ManifestMetadata) -> Result<bool, Error> {
    match manifest.api(client).get_opt(&manifest.name).await {
        Ok(found) => Ok(found.is_some()),
        Err(e) => Err(Error::internal_with_context(
            "manifest_exists",
            format!(
                "failed to get {}/{}: {}",
                manifest.api_resource.kind, manifest.name, e
            ),
        )),
    }
}
