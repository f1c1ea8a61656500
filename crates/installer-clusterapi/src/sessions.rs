//! Cloud credentials handed to infrastructure controllers

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::install_config::{AzurePlatform, GcpPlatform};

/// Environment variable overriding the Azure service principal file
pub const AZURE_AUTH_LOCATION_ENV: &str = "AZURE_AUTH_LOCATION";
/// Environment variable naming the GCP service account file
pub const GOOGLE_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Azure service principal used by CAPZ and ASO
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AzureSession {
    /// Application (client) id
    pub client_id: String,
    /// Client secret; empty for certificate or workload identity auth
    pub client_secret: String,
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Subscription id
    pub subscription_id: String,
    /// Azure cloud environment
    pub cloud_name: String,
}

impl AzureSession {
    /// Variables for the controller environment
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("AZURE_CLIENT_ID".to_string(), self.client_id.clone()),
            ("AZURE_TENANT_ID".to_string(), self.tenant_id.clone()),
            ("AZURE_SUBSCRIPTION_ID".to_string(), self.subscription_id.clone()),
        ]);
        if !self.client_secret.is_empty() {
            env.insert("AZURE_CLIENT_SECRET".to_string(), self.client_secret.clone());
        }
        if !self.cloud_name.is_empty() {
            env.insert("AZURE_ENVIRONMENT".to_string(), self.cloud_name.clone());
        }
        env
    }
}

/// GCP service account used by CAPG
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcpSession {
    /// Path of the service account JSON key
    pub credentials_file: PathBuf,
}

impl GcpSession {
    /// Variables for the controller environment
    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            GOOGLE_CREDENTIALS_ENV.to_string(),
            self.credentials_file.display().to_string(),
        )])
    }
}

/// Resolves cloud sessions for the selected platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudSessions: Send + Sync {
    /// Azure credentials
    async fn azure(&self, platform: &AzurePlatform) -> Result<AzureSession>;

    /// GCP credentials
    async fn gcp(&self, platform: &GcpPlatform) -> Result<GcpSession>;
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Sessions from environment variables and the installer's credential files
pub struct DefaultSessions {
    home: Option<PathBuf>,
    env: EnvLookup,
}

impl Default for DefaultSessions {
    fn default() -> Self {
        Self {
            home: dirs::home_dir(),
            env: Box::new(|key| std::env::var(key).ok().filter(|v| !v.is_empty())),
        }
    }
}

impl DefaultSessions {
    /// Sessions from the process environment and the user's home directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions with an explicit home directory and environment
    pub fn with_env(
        home: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            home,
            env: Box::new(env),
        }
    }

    fn home_file(&self, relative: &str) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join(relative))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePrincipal {
    #[serde(default)]
    subscription_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    tenant_id: String,
}

fn read_service_principal(path: &Path) -> Result<ServicePrincipal> {
    let data = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::credentials("azure", format!("{}: {e}", path.display())))
}

#[async_trait]
impl CloudSessions for DefaultSessions {
    async fn azure(&self, platform: &AzurePlatform) -> Result<AzureSession> {
        let file = (self.env)(AZURE_AUTH_LOCATION_ENV)
            .map(PathBuf::from)
            .or_else(|| self.home_file(".azure/osServicePrincipal.json"))
            .filter(|p| p.is_file());
        let from_file = match &file {
            Some(path) => {
                debug!(path = %path.display(), "reading azure service principal");
                Some(read_service_principal(path)?)
            }
            None => None,
        };

        let pick = |key: &str, file_value: Option<&String>| {
            (self.env)(key)
                .or_else(|| file_value.filter(|v| !v.is_empty()).cloned())
                .unwrap_or_default()
        };
        let session = AzureSession {
            client_id: pick("AZURE_CLIENT_ID", from_file.as_ref().map(|f| &f.client_id)),
            client_secret: pick(
                "AZURE_CLIENT_SECRET",
                from_file.as_ref().map(|f| &f.client_secret),
            ),
            tenant_id: pick("AZURE_TENANT_ID", from_file.as_ref().map(|f| &f.tenant_id)),
            subscription_id: pick(
                "AZURE_SUBSCRIPTION_ID",
                from_file.as_ref().map(|f| &f.subscription_id),
            ),
            cloud_name: platform
                .cloud_name
                .clone()
                .unwrap_or_else(|| "AzurePublicCloud".to_string()),
        };

        let missing: Vec<&str> = [
            ("clientId", &session.client_id),
            ("tenantId", &session.tenant_id),
            ("subscriptionId", &session.subscription_id),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(Error::credentials(
                "azure",
                format!("missing {}", missing.join(", ")),
            ));
        }
        Ok(session)
    }

    async fn gcp(&self, _platform: &GcpPlatform) -> Result<GcpSession> {
        let path = (self.env)(GOOGLE_CREDENTIALS_ENV)
            .map(PathBuf::from)
            .or_else(|| self.home_file(".gcp/osServiceAccount.json"))
            .ok_or_else(|| Error::credentials("gcp", "no service account file found"))?;
        if !path.is_file() {
            return Err(Error::credentials(
                "gcp",
                format!("service account file {} does not exist", path.display()),
            ));
        }
        Ok(GcpSession {
            credentials_file: path,
        })
    }
}
