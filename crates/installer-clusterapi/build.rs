//! Embeds the provider binaries archive and the static manifests bundle
//!
//! `CAPI_INSTALLER_PROVIDERS_ZIP` and `CAPI_INSTALLER_MANIFESTS_ZIP` name zip
//! files produced by the release build. When unset an empty archive is
//! embedded so development builds still link; binaries are then resolved
//! from `CAPI_INSTALLER_ASSETS` or `PATH` at runtime.

use std::env;
use std::fs;
use std::path::PathBuf;

/// End-of-central-directory record of a zip archive with no entries
const EMPTY_ZIP: [u8; 22] = [
    0x50, 0x4b, 0x05, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

fn embed(var: &str, out_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed={var}");
    let out = PathBuf::from(env::var("OUT_DIR")?).join(out_name);

    match env::var_os(var) {
        Some(src) if !src.is_empty() => {
            let src = PathBuf::from(src);
            println!("cargo:rerun-if-changed={}", src.display());
            fs::copy(&src, &out)?;
        }
        _ => fs::write(&out, EMPTY_ZIP)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    embed("CAPI_INSTALLER_PROVIDERS_ZIP", "providers.zip")?;
    embed("CAPI_INSTALLER_MANIFESTS_ZIP", "manifests.zip")?;
    Ok(())
}
