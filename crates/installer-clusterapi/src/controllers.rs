//! Controllers run against the local control plane, per platform
//!
//! The core Cluster API controller always runs first; the platform's
//! infrastructure controllers follow in a fixed order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::install_config::{InstallConfig, Platform};
use crate::providers::{self, Provider};
use crate::sessions::CloudSessions;

/// Namespace ASO expects to be running in
const ASO_NAMESPACE: &str = "capz-system";

/// One controller binary with its manifests, arguments and environment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Controller {
    /// Provider whose archive entries hold the binary
    pub provider: Option<Provider>,
    /// Human readable name, used in errors and log file names
    pub name: String,
    /// Binary file name inside the binaries directory
    pub binary: String,
    /// Working directory; a temporary directory when unset
    pub working_dir: Option<PathBuf>,
    /// Manifests holding the controller's CRDs and webhook configurations
    pub manifest_paths: Vec<PathBuf>,
    /// Argument templates
    pub args: Vec<String>,
    /// Flags appended only when `--help` shows the binary supports them
    pub optional_args: Vec<String>,
    /// Extra environment; `KUBECONFIG` is always overridden
    pub env: BTreeMap<String, String>,
}

impl Controller {
    /// File-system friendly form of the name
    pub fn slug(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments shared by every controller-runtime based provider
fn standard_args(extra: &[&str]) -> Vec<String> {
    let mut args = strings(&[
        "-v=2",
        "--leader-elect=false",
        "--health-addr={{ health_addr }}",
        "--webhook-port={{ webhook_port }}",
        "--webhook-cert-dir={{ webhook_cert_dir }}",
    ]);
    args.extend(strings(extra));
    args
}

fn standard_optional_args() -> Vec<String> {
    strings(&["--diagnostics-address=0", "--insecure-diagnostics"])
}

fn infrastructure(
    provider: Provider,
    name: &str,
    components_dir: &Path,
    manifest: &str,
    extra_args: &[&str],
) -> Controller {
    Controller {
        provider: Some(provider),
        name: name.to_string(),
        binary: provider.sources.first().copied().unwrap_or(provider.name).to_string(),
        manifest_paths: vec![components_dir.join(manifest)],
        args: standard_args(extra_args),
        optional_args: standard_optional_args(),
        ..Controller::default()
    }
}

/// The core Cluster API controller
pub fn cluster_api(components_dir: &Path) -> Controller {
    Controller {
        provider: Some(providers::CLUSTER_API),
        name: "Cluster API".to_string(),
        binary: "cluster-api".to_string(),
        manifest_paths: vec![components_dir.join("core-components.yaml")],
        args: standard_args(&["--feature-gates=MachineSetPreflightChecks=false"]),
        optional_args: standard_optional_args(),
        ..Controller::default()
    }
}

/// Every controller for the install config, core controller first
///
/// Credentials are resolved before anything is returned, so a failure here
/// means no controller needs to be stopped.
pub async fn controllers_for(
    install_config: &InstallConfig,
    components_dir: &Path,
    sessions: &dyn CloudSessions,
) -> Result<Vec<Controller>> {
    let mut controllers = vec![cluster_api(components_dir)];
    let dir = components_dir;

    match &install_config.platform {
        Platform::Aws(_) => controllers.push(infrastructure(
            providers::AWS,
            "AWS Infrastructure Provider",
            dir,
            "aws-infrastructure-components.yaml",
            &[
                "--feature-gates=BootstrapFormatIgnition=true,ExternalResourceGC=true,TagUnmanagedNetworkResources=false,EKS=false",
            ],
        )),
        Platform::Azure(azure) => {
            let session = sessions.azure(azure).await?;
            let mut capz = infrastructure(
                providers::AZURE,
                "Azure Infrastructure Provider",
                dir,
                "azure-infrastructure-components.yaml",
                &["--feature-gates=MachinePool=false"],
            );
            capz.env = session.env();

            let mut aso = infrastructure(
                providers::AZURE_ASO,
                "Azure Service Operator",
                dir,
                "azure-aso-infrastructure-components.yaml",
                &["--crd-pattern=", "--enable-crd-management=false"],
            );
            aso.args.retain(|a| !a.starts_with("--leader-elect"));
            aso.optional_args.clear();
            aso.env = session.env();
            aso.env.insert("POD_NAMESPACE".to_string(), ASO_NAMESPACE.to_string());

            controllers.extend([capz, aso]);
        }
        Platform::Gcp(gcp) => {
            let session = sessions.gcp(gcp).await?;
            let mut capg = infrastructure(
                providers::GCP,
                "GCP Infrastructure Provider",
                dir,
                "gcp-infrastructure-components.yaml",
                &["--feature-gates=GKE=false"],
            );
            capg.env = session.env();
            controllers.push(capg);
        }
        Platform::Other { name, .. } => match name.as_str() {
            "ibmcloud" => controllers.push(infrastructure(
                providers::IBMCLOUD,
                "IBM Cloud Infrastructure Provider",
                dir,
                "ibmcloud-infrastructure-components.yaml",
                &[],
            )),
            "powervs" => controllers.push(infrastructure(
                providers::IBMCLOUD,
                "IBM Cloud Infrastructure Provider",
                dir,
                "ibmcloud-infrastructure-components.yaml",
                &["--provider-id-fmt=v2"],
            )),
            "nutanix" => controllers.push(infrastructure(
                providers::NUTANIX,
                "Nutanix Infrastructure Provider",
                dir,
                "nutanix-infrastructure-components.yaml",
                &[],
            )),
            "openstack" => controllers.push(infrastructure(
                providers::OPENSTACK,
                "OpenStack Infrastructure Provider",
                dir,
                "openstack-infrastructure-components.yaml",
                &[],
            )),
            "vsphere" => controllers.push(infrastructure(
                providers::VSPHERE,
                "VSphere Infrastructure Provider",
                dir,
                "vsphere-infrastructure-components.yaml",
                &[],
            )),
            other => return Err(Error::UnsupportedPlatform(other.to_string())),
        },
    }

    debug!(
        platform = install_config.platform.name(),
        controllers = controllers.len(),
        "assembled controllers"
    );
    Ok(controllers)
}
