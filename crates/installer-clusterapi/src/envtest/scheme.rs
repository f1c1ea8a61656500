//! API groups served by the installer's controllers

use std::collections::BTreeSet;

/// Cluster API and provider API groups
const INSTALLER_GROUPS: &[&str] = &[
    "cluster.x-k8s.io",
    "addons.cluster.x-k8s.io",
    "bootstrap.cluster.x-k8s.io",
    "controlplane.cluster.x-k8s.io",
    "ipam.cluster.x-k8s.io",
    "runtime.cluster.x-k8s.io",
    "infrastructure.cluster.x-k8s.io",
    // Azure Service Operator
    "resources.azure.com",
    "network.azure.com",
    "compute.azure.com",
    "storage.azure.com",
    "managedidentity.azure.com",
    "authorization.azure.com",
    "containerservice.azure.com",
];

/// Registry of API groups whose CRDs may be rewired to local webhooks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scheme {
    groups: BTreeSet<String>,
}

impl Default for Scheme {
    fn default() -> Self {
        Self::installer()
    }
}

impl Scheme {
    /// An empty scheme
    pub fn empty() -> Self {
        Self {
            groups: BTreeSet::new(),
        }
    }

    /// Every group the installer's controllers serve
    pub fn installer() -> Self {
        INSTALLER_GROUPS
            .iter()
            .fold(Self::empty(), |s, g| s.with_group(*g))
    }

    /// Add a group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Whether the group is registered
    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installer_scheme_knows_capi_groups() {
        let scheme = Scheme::default();
        assert!(scheme.contains_group("cluster.x-k8s.io"));
        assert!(scheme.contains_group("infrastructure.cluster.x-k8s.io"));
        assert!(scheme.contains_group("resources.azure.com"));
        assert!(!scheme.contains_group("apps"));
    }

    #[test]
    fn groups_can_be_added() {
        let scheme = Scheme::empty().with_group("example.com");
        assert!(scheme.contains_group("example.com"));
        assert!(!scheme.contains_group("cluster.x-k8s.io"));
    }
}
