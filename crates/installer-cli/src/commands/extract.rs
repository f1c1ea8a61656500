//! `extract`: unpack a provider's binaries from the embedded archive

use std::path::PathBuf;

use clap::Args;
use installer_clusterapi::providers::{self, ProviderArchive};
use tracing::info;

use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Provider to extract; every provider when omitted
    #[arg(long)]
    pub provider: Option<String>,

    /// Destination directory
    #[arg(long, default_value = "cluster-api")]
    pub dir: PathBuf,
}

pub fn run(args: ExtractArgs) -> Result<()> {
    let provider = match &args.provider {
        Some(name) => Some(
            providers::by_name(name).ok_or_else(|| Error::UnknownProvider { name: name.clone() })?,
        ),
        None => None,
    };

    let archive = ProviderArchive::embedded()?;
    let written = match provider {
        Some(provider) => archive.extract(&provider, &args.dir)?,
        None => archive.extract_all(&args.dir)?,
    };

    info!(count = written.len(), dir = %args.dir.display(), "Extracted provider binaries");
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
