//! `run`: keep the local control plane up until interrupted

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::start_system;
use crate::Result;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Installation directory holding state and artifacts
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Install config to read the platform from
    #[arg(long, default_value = "install-config.yaml")]
    pub install_config: PathBuf,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let system = start_system(&args.install_config, &args.dir).await?;

    if let Some(path) = system.kubeconfig_path() {
        println!("{}", path.display());
    }
    info!("Control plane running, press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    system.teardown().await;
    signal?;
    Ok(())
}
