//! CustomResourceDefinition install with local conversion webhooks

use std::path::PathBuf;
use std::time::Duration;

use installer_common::kube_utils::{self, ManifestMetadata};
use installer_common::yaml::read_manifest_documents;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Scheme, WebhookInstallOptions};
use crate::error::{Error, Result};

const CRD_KIND: &str = "CustomResourceDefinition";

/// What to install and how long to wait for it
pub struct CrdInstallOptions<'a> {
    /// Groups whose conversion webhooks are served locally
    pub scheme: &'a Scheme,
    /// Files or directories holding CRD manifests
    pub paths: Vec<PathBuf>,
    /// Prepared webhook serving details
    pub webhook_options: &'a WebhookInstallOptions,
    /// Upper bound on waiting for every CRD to be established
    pub max_time: Duration,
    /// Delay between establishment checks
    pub poll_interval: Duration,
}

impl<'a> CrdInstallOptions<'a> {
    /// Options with the default wait bounds
    pub fn new(
        scheme: &'a Scheme,
        paths: Vec<PathBuf>,
        webhook_options: &'a WebhookInstallOptions,
    ) -> Self {
        Self {
            scheme,
            paths,
            webhook_options,
            max_time: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Read CRDs from the paths and rewrite conversion webhooks
    pub fn prepare(&self) -> Result<Vec<Value>> {
        let mut crds = Vec::new();
        for mut doc in read_manifest_documents(&self.paths)? {
            if kube_utils::kind_of(&doc) != CRD_KIND {
                continue;
            }
            self.rewrite_conversion(&mut doc)?;
            crds.push(doc);
        }
        Ok(crds)
    }

    fn rewrite_conversion(&self, crd: &mut Value) -> Result<()> {
        let group = crd
            .pointer("/spec/group")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let strategy = crd
            .pointer("/spec/conversion/strategy")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if strategy != "Webhook" || !self.scheme.contains_group(group) {
            return Ok(());
        }

        let url = self.webhook_options.serving_url("/convert");
        let ca_bundle = self.webhook_options.ca_bundle();
        let conversion = crd
            .pointer_mut("/spec/conversion")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::Crd("conversion is not an object".to_string()))?;

        let review_versions = conversion
            .get("webhook")
            .and_then(|w| w.get("conversionReviewVersions"))
            .cloned()
            .unwrap_or_else(|| json!(["v1", "v1beta1"]));
        conversion.insert(
            "webhook".to_string(),
            json!({
                "clientConfig": { "url": url, "caBundle": ca_bundle },
                "conversionReviewVersions": review_versions,
            }),
        );
        Ok(())
    }
}

/// Apply every CRD found in the options' paths and wait until each is
/// established; returns the CRD names
pub async fn install_crds(client: &Client, options: &CrdInstallOptions<'_>) -> Result<Vec<String>> {
    let crds = options
        .prepare()?
        .into_iter()
        .map(ManifestMetadata::from_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if crds.is_empty() {
        return Ok(Vec::new());
    }

    for crd in &crds {
        kube_utils::apply_manifest(client, crd)
            .await
            .map_err(|e| Error::Crd(format!("{}: {e}", crd.name)))?;
        debug!(crd = %crd.name, "applied CRD");
    }

    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in &crds {
        kube_utils::poll_until(
            options.max_time,
            options.poll_interval,
            format!("CRD {} was not established", crd.name),
            || is_established(&api, &crd.name),
        )
        .await
        .map_err(|e| Error::Crd(e.to_string()))?;
    }

    info!(count = crds.len(), "installed CRDs");
    Ok(crds.into_iter().map(|c| c.name).collect())
}

async fn is_established(
    api: &Api<CustomResourceDefinition>,
    name: &str,
) -> installer_common::Result<bool> {
    let crd = api.get_opt(name).await?;
    Ok(crd
        .and_then(|c| c.status)
        .and_then(|s| s.conditions)
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Established" && c.status == "True"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRDS: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: clusters.cluster.x-k8s.io
spec:
  group: cluster.x-k8s.io
  names: { kind: Cluster, plural: clusters }
  scope: Namespaced
  conversion:
    strategy: Webhook
    webhook:
      conversionReviewVersions: ["v1"]
      clientConfig:
        service: { name: capi-webhook-service, namespace: capi-system, path: /convert }
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  names: { kind: Widget, plural: widgets }
  scope: Namespaced
  conversion:
    strategy: Webhook
    webhook:
      clientConfig:
        service: { name: widget-webhook, namespace: default, path: /convert }
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: machines.cluster.x-k8s.io
spec:
  group: cluster.x-k8s.io
  names: { kind: Machine, plural: machines }
  scope: Namespaced
---
apiVersion: v1
kind: Namespace
metadata:
  name: capi-system
"#;

    #[test]
    fn rewrites_conversion_for_known_groups_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crds.yaml"), CRDS).unwrap();
        let mut webhooks = WebhookInstallOptions {
            local_serving_port: 9443,
            local_serving_cert_dir: Some(dir.path().join("certs")),
            ..WebhookInstallOptions::default()
        };
        webhooks.prepare().unwrap();
        let scheme = Scheme::default();
        let options = CrdInstallOptions::new(&scheme, vec![dir.path().to_path_buf()], &webhooks);

        let crds = options.prepare().unwrap();
        assert_eq!(crds.len(), 3);

        let clusters = &crds[0];
        assert_eq!(
            clusters
                .pointer("/spec/conversion/webhook/clientConfig/url")
                .and_then(Value::as_str),
            Some("https://127.0.0.1:9443/convert")
        );
        assert_eq!(
            clusters.pointer("/spec/conversion/webhook/conversionReviewVersions"),
            Some(&json!(["v1"]))
        );

        let widgets = &crds[1];
        assert!(widgets
            .pointer("/spec/conversion/webhook/clientConfig/service")
            .is_some());

        let machines = &crds[2];
        assert!(machines.pointer("/spec/conversion").is_none());
    }
}
