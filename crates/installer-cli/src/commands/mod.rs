//! CLI command implementations

pub mod add_nodes;
pub mod extract;
pub mod monitor;
pub mod run;

use std::path::Path;
use std::time::Duration;

use installer_clusterapi::machine::Phase;
use installer_clusterapi::{InstallConfig, System, SystemConfig};
use installer_common::kube_utils::build_api_resource;
use kube::api::{Api, DynamicObject, ListParams};
use kube::Client;
use tracing::{info, warn};

use crate::{Error, Result};

/// API version of the Cluster API Machine resource
pub const MACHINE_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// How often machine phases are re-read
pub const MACHINE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Load the install config and bring the system up in `dir`
///
/// On failure the partially started system is torn down before returning.
pub(crate) async fn start_system(install_config: &Path, dir: &Path) -> Result<System> {
    if !install_config.exists() {
        return Err(Error::MissingPath {
            path: install_config.to_path_buf(),
        });
    }
    let config = InstallConfig::load(install_config)?;
    info!(platform = config.platform.name(), "Starting local control plane");

    let mut system = System::new(SystemConfig::for_dir(dir))?;
    if let Err(e) = system.run(&config).await {
        system.teardown().await;
        return Err(e.into());
    }
    Ok(system)
}

/// Phase of every Machine, keyed by `namespace/name`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MachineSummary {
    pub running: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

impl MachineSummary {
    /// Sort machines into buckets by reported phase
    ///
    /// A missing or unrecognized phase counts as pending.
    pub fn from_phases<'a>(phases: impl IntoIterator<Item = (String, Option<&'a str>)>) -> Self {
        let mut summary = Self::default();
        for (name, phase) in phases {
            match phase.and_then(|p| p.parse::<Phase>().ok()) {
                Some(Phase::Running) => summary.running.push(name),
                Some(Phase::Failed) => summary.failed.push(name),
                _ => summary.pending.push(name),
            }
        }
        summary
    }

    /// True once at least one machine exists and none is still pending
    pub fn settled(&self) -> bool {
        self.pending.is_empty() && (!self.running.is_empty() || !self.failed.is_empty())
    }

    fn pending_list(&self) -> String {
        if self.pending.is_empty() {
            "no machines found".to_string()
        } else {
            self.pending.join(", ")
        }
    }
}

/// Read the current phase of every Machine in the cluster
pub(crate) async fn machine_summary(client: &Client) -> Result<MachineSummary> {
    let ar = build_api_resource(MACHINE_API_VERSION, "Machine");
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    let machines = api.list(&ListParams::default()).await?;

    Ok(MachineSummary::from_phases(machines.items.iter().map(|m| {
        let name = format!(
            "{}/{}",
            m.metadata.namespace.as_deref().unwrap_or_default(),
            m.metadata.name.as_deref().unwrap_or_default()
        );
        let phase = m
            .data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str());
        (name, phase)
    })))
}

/// Poll machines until every one is Running
///
/// Fails as soon as any machine reports Failed. List errors are logged and
/// retried since the API server may still be settling.
pub(crate) async fn wait_for_machines(client: &Client, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = MachineSummary::default();

    loop {
        match machine_summary(client).await {
            Ok(summary) => {
                if !summary.failed.is_empty() {
                    return Err(Error::MachinesFailed {
                        names: summary.failed,
                    });
                }
                if summary.settled() {
                    info!(count = summary.running.len(), "All machines running");
                    return Ok(());
                }
                if summary != last {
                    info!(
                        running = summary.running.len(),
                        pending = summary.pending.len(),
                        "Waiting for machines"
                    );
                }
                last = summary;
            }
            Err(e) => warn!(error = %e, "Failed to list machines, retrying"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::MachinesTimedOut {
                seconds: timeout.as_secs(),
                pending: last.pending_list(),
            });
        }
        tokio::time::sleep(MACHINE_POLL_INTERVAL).await;
    }
}

/// Parse a duration given as seconds or with an `s`, `m` or `h` suffix
pub(crate) fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let (digits, unit) = match input.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("invalid duration unit in {input:?}")),
    };
    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("invalid duration {input:?}"))?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(phases: &[(&str, Option<&'static str>)]) -> MachineSummary {
        MachineSummary::from_phases(phases.iter().map(|(n, p)| (n.to_string(), *p)))
    }

    #[test]
    fn summary_buckets_by_phase() {
        let s = summary(&[
            ("ns/a", Some("Running")),
            ("ns/b", Some("Provisioning")),
            ("ns/c", Some("Failed")),
            ("ns/d", None),
            ("ns/e", Some("Weird")),
        ]);
        assert_eq!(s.running, vec!["ns/a"]);
        assert_eq!(s.failed, vec!["ns/c"]);
        assert_eq!(s.pending, vec!["ns/b", "ns/d", "ns/e"]);
        assert!(!s.settled());
    }

    #[test]
    fn empty_summary_is_not_settled() {
        let s = summary(&[]);
        assert!(!s.settled());
        assert_eq!(s.pending_list(), "no machines found");
    }

    #[test]
    fn all_running_is_settled() {
        let s = summary(&[("ns/a", Some("Running")), ("ns/b", Some("Running"))]);
        assert!(s.settled());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn rejects_durations_that_overflow() {
        let err = parse_duration("18446744073709551615h").unwrap_err();
        assert!(err.contains("invalid duration"), "{err}");
        assert!(parse_duration("18446744073709551615m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }
}
