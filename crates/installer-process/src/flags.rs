//! Feature detection of optional command-line flags

use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Whether `binary --help` advertises `--flag`
///
/// The exit status of `--help` is ignored since many tools exit non-zero
/// after printing usage. Both stdout and stderr are searched.
pub async fn check_flag(binary: &Path, flag: &str) -> Result<bool> {
    let flag = flag.trim_start_matches('-');
    let probe_err = |message: String| ProcessError::FlagProbe {
        binary: binary.to_path_buf(),
        flag: flag.to_string(),
        message,
    };

    let output = tokio::process::Command::new(binary)
        .arg("--help")
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| probe_err(e.to_string()))?;

    let pattern = format!(r"(?m)^\s*--{}(?:[\s=]|$)", regex::escape(flag));
    let re = Regex::new(&pattern).map_err(|e| probe_err(e.to_string()))?;

    let found = re.is_match(&String::from_utf8_lossy(&output.stdout))
        || re.is_match(&String::from_utf8_lossy(&output.stderr));
    debug!(binary = %binary.display(), flag, found, "probed optional flag");
    Ok(found)
}
