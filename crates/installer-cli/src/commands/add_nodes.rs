//! `add-nodes`: create machines through the local control plane

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use installer_common::kube_utils::{apply_manifest, ManifestMetadata};
use installer_common::yaml::read_manifest_documents;
use tracing::info;

use super::{parse_duration, start_system, wait_for_machines};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct AddNodesArgs {
    /// Installation directory holding state and artifacts
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Install config to read the platform from
    #[arg(long, default_value = "install-config.yaml")]
    pub install_config: PathBuf,

    /// File or directory of manifests to apply (Machines and their infrastructure)
    #[arg(long)]
    pub manifests: Option<PathBuf>,

    /// How long to wait for the machines to run
    #[arg(long, default_value = "30m", value_parser = parse_duration)]
    pub timeout: Duration,
}

pub async fn run(args: AddNodesArgs) -> Result<()> {
    let manifests = match &args.manifests {
        Some(path) => load_manifests(path)?,
        None => Vec::new(),
    };

    let system = start_system(&args.install_config, &args.dir).await?;

    let outcome = tokio::select! {
        res = apply_and_wait(&system, &manifests, args.timeout) => res,
        _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
    };

    system.teardown().await;
    outcome
}

fn load_manifests(path: &Path) -> Result<Vec<ManifestMetadata>> {
    if !path.exists() {
        return Err(Error::MissingPath {
            path: path.to_path_buf(),
        });
    }
    let documents = read_manifest_documents(&[path.to_path_buf()])?;
    let manifests = documents
        .into_iter()
        .map(ManifestMetadata::from_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(manifests)
}

async fn apply_and_wait(
    system: &installer_clusterapi::System,
    manifests: &[ManifestMetadata],
    timeout: Duration,
) -> Result<()> {
    let client = system.client().ok_or(Error::ControlPlaneNotRunning)?;

    for manifest in manifests {
        apply_manifest(&client, manifest).await?;
        info!(kind = %manifest.api_resource.kind, name = %manifest.name, "Applied manifest");
    }

    wait_for_machines(&client, timeout).await
}
