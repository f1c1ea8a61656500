//! Common types for the cluster-api installer: errors, YAML, kube helpers and PKI

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod pki;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by the installer
pub const FIELD_MANAGER: &str = "cluster-api-installer";
