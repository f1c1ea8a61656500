//! Kubeconfig for the local control plane
//!
//! A single cluster, context and user, all named `envtest`, with the CA,
//! client certificate and key inlined as base64 data.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envtest::RestConfig;
use crate::error::{Error, Result};

/// Name shared by the cluster, context and user entries
pub const ENVTEST_NAME: &str = "envtest";

/// Kubeconfig structure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    #[serde(rename = "current-context")]
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry in kubeconfig
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// Client key (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    /// User name for basic identification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Context entry in kubeconfig
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

impl Kubeconfig {
    /// Build the single-cluster kubeconfig for a REST config
    pub fn from_rest_config(config: &RestConfig) -> Self {
        let encode = |data: &[u8]| (!data.is_empty()).then(|| STANDARD.encode(data));
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: ENVTEST_NAME.to_string(),
                cluster: ClusterConfig {
                    server: config.host.clone(),
                    certificate_authority_data: encode(&config.ca_data),
                },
            }],
            users: vec![NamedUser {
                name: ENVTEST_NAME.to_string(),
                user: UserConfig {
                    client_certificate_data: encode(&config.cert_data),
                    client_key_data: encode(&config.key_data),
                    username: (!config.username.is_empty()).then(|| config.username.clone()),
                },
            }],
            contexts: vec![NamedContext {
                name: ENVTEST_NAME.to_string(),
                context: ContextConfig {
                    cluster: ENVTEST_NAME.to_string(),
                    user: ENVTEST_NAME.to_string(),
                },
            }],
            current_context: ENVTEST_NAME.to_string(),
        }
    }

    /// Recover the REST config for the current context
    pub fn to_rest_config(&self) -> Result<RestConfig> {
        let missing = |what: &str| Error::Kubeconfig(format!("{what} not found"));
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .ok_or_else(|| missing("current context"))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| missing("cluster"))?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .ok_or_else(|| missing("user"))?;

        let decode = |data: &Option<String>| -> Result<Vec<u8>> {
            match data {
                Some(d) => STANDARD
                    .decode(d)
                    .map_err(|e| Error::Kubeconfig(format!("invalid base64 data: {e}"))),
                None => Ok(Vec::new()),
            }
        };

        Ok(RestConfig {
            host: cluster.cluster.server.clone(),
            ca_data: decode(&cluster.cluster.certificate_authority_data)?,
            cert_data: decode(&user.user.client_certificate_data)?,
            key_data: decode(&user.user.client_key_data)?,
            username: user.user.username.clone().unwrap_or_default(),
        })
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Kubeconfig(e.to_string()))
    }

    /// Parse from YAML
    pub fn from_yaml(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).map_err(|e| Error::Kubeconfig(e.to_string()))
    }

    /// Write as YAML, readable only by the owner on unix
    pub fn write(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        std::fs::write(path, yaml).map_err(|e| Error::io(path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::io(path, e))?;
        }
        Ok(())
    }
}
