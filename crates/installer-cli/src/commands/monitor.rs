//! `monitor-add-nodes`: watch machines on an existing cluster

use std::path::Path;
use std::time::Duration;

use clap::Args;
use installer_common::kube_utils::create_client;

use super::{parse_duration, wait_for_machines};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// How long to wait for the machines to run
    #[arg(long, default_value = "30m", value_parser = parse_duration)]
    pub timeout: Duration,
}

pub async fn run(args: MonitorArgs, kubeconfig: &Path) -> Result<()> {
    if !kubeconfig.exists() {
        return Err(Error::MissingPath {
            path: kubeconfig.to_path_buf(),
        });
    }
    let client = create_client(kubeconfig).await?;

    tokio::select! {
        res = wait_for_machines(&client, args.timeout) => res,
        _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
    }
}
