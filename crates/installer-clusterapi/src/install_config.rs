//! The subset of the install config the bootstrap needs
//!
//! `platform` is a mapping with exactly one key naming the target platform.
//! Sections the bootstrap reads are typed; every other platform's settings
//! are kept as raw YAML.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cluster name and metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Cluster name
    #[serde(default)]
    pub name: String,
}

/// AWS platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsPlatform {
    /// Region the cluster is installed in
    #[serde(default)]
    pub region: String,
}

/// Azure platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatform {
    /// Azure cloud environment, e.g. `AzurePublicCloud`
    #[serde(default)]
    pub cloud_name: Option<String>,
    /// Region the cluster is installed in
    #[serde(default)]
    pub region: String,
}

/// GCP platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpPlatform {
    /// Project hosting the cluster
    #[serde(default, rename = "projectID")]
    pub project_id: String,
    /// Region the cluster is installed in
    #[serde(default)]
    pub region: String,
}

/// The single selected platform
#[derive(Clone, Debug, PartialEq)]
pub enum Platform {
    /// Amazon Web Services
    Aws(AwsPlatform),
    /// Microsoft Azure
    Azure(AzurePlatform),
    /// Google Cloud
    Gcp(GcpPlatform),
    /// Any other platform, settings untyped
    Other {
        /// Platform key
        name: String,
        /// Raw settings
        settings: serde_yaml::Value,
    },
}

impl Platform {
    /// Platform key as written in the install config
    pub fn name(&self) -> &str {
        match self {
            Self::Aws(_) => "aws",
            Self::Azure(_) => "azure",
            Self::Gcp(_) => "gcp",
            Self::Other { name, .. } => name,
        }
    }

    /// A platform with default settings
    pub fn named(name: &str) -> Self {
        match name {
            "aws" => Self::Aws(AwsPlatform::default()),
            "azure" => Self::Azure(AzurePlatform::default()),
            "gcp" => Self::Gcp(GcpPlatform::default()),
            other => Self::Other {
                name: other.to_string(),
                settings: serde_yaml::Value::Null,
            },
        }
    }

    fn from_map(map: BTreeMap<String, serde_yaml::Value>) -> Result<Self> {
        let mut entries = map.into_iter();
        let (name, settings) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            (None, _) => return Err(Error::InstallConfig("no platform specified".to_string())),
            (Some((first, _)), Some((second, _))) => {
                return Err(Error::InstallConfig(format!(
                    "multiple platforms specified: {first}, {second}"
                )))
            }
        };
        let typed = |e: serde_yaml::Error| Error::InstallConfig(format!("platform.{name}: {e}"));
        let settings_or_default = |v: serde_yaml::Value| {
            if v.is_null() {
                serde_yaml::Value::Mapping(Default::default())
            } else {
                v
            }
        };
        Ok(match name.as_str() {
            "aws" => Self::Aws(serde_yaml::from_value(settings_or_default(settings)).map_err(typed)?),
            "azure" => {
                Self::Azure(serde_yaml::from_value(settings_or_default(settings)).map_err(typed)?)
            }
            "gcp" => Self::Gcp(serde_yaml::from_value(settings_or_default(settings)).map_err(typed)?),
            _ => Self::Other {
                name: name.clone(),
                settings,
            },
        })
    }
}

#[derive(Deserialize)]
struct RawInstallConfig {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    platform: BTreeMap<String, serde_yaml::Value>,
}

/// Install config as read by the bootstrap
#[derive(Clone, Debug, PartialEq)]
pub struct InstallConfig {
    /// Cluster metadata
    pub metadata: ObjectMeta,
    /// Selected platform
    pub platform: Platform,
}

impl InstallConfig {
    /// An install config for `platform` with default settings
    pub fn for_platform(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::default(),
            platform: Platform::named(name),
        }
    }

    /// Parse from YAML
    pub fn from_yaml(input: &str) -> Result<Self> {
        let raw: RawInstallConfig =
            serde_yaml::from_str(input).map_err(|e| Error::InstallConfig(e.to_string()))?;
        Ok(Self {
            metadata: raw.metadata,
            platform: Platform::from_map(raw.platform)?,
        })
    }

    /// Read and parse a file
    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_platforms() {
        let config = InstallConfig::from_yaml(
            r#"
apiVersion: v1
metadata:
  name: demo
platform:
  gcp:
    projectID: my-project
    region: us-east1
"#,
        )
        .unwrap();
        assert_eq!(config.metadata.name, "demo");
        assert_eq!(config.platform.name(), "gcp");
        let Platform::Gcp(gcp) = &config.platform else {
            panic!("expected gcp");
        };
        assert_eq!(gcp.project_id, "my-project");
    }

    #[test]
    fn keeps_untyped_platforms() {
        let config = InstallConfig::from_yaml(
            "metadata: {name: lab}\nplatform:\n  vsphere:\n    vcenters: []\n",
        )
        .unwrap();
        assert_eq!(config.platform.name(), "vsphere");
    }

    #[test]
    fn empty_section_is_defaulted() {
        let config = InstallConfig::from_yaml("platform:\n  aws: {}\n").unwrap();
        assert_eq!(config.platform, Platform::Aws(AwsPlatform::default()));
        let config = InstallConfig::from_yaml("platform:\n  azure:\n").unwrap();
        assert_eq!(config.platform.name(), "azure");
    }

    #[test]
    fn requires_exactly_one_platform() {
        assert!(matches!(
            InstallConfig::from_yaml("metadata: {name: x}\n"),
            Err(Error::InstallConfig(_))
        ));
        let err = InstallConfig::from_yaml("platform:\n  aws: {}\n  gcp: {}\n").unwrap_err();
        assert!(err.to_string().contains("multiple platforms"));
    }

    #[test]
    fn named_round_trips_name() {
        for name in ["aws", "azure", "gcp", "nutanix", "made-up-platform"] {
            assert_eq!(Platform::named(name).name(), name);
        }
    }
}
