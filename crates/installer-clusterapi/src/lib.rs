//! Local Cluster API control plane bootstrap and controller supervision
//!
//! This crate provides:
//! - [`ProviderArchive`]: provider binaries extracted from an embedded zip
//! - [`envtest`]: an ephemeral etcd + kube-apiserver pair, plus webhook and
//!   CRD installation pointed at locally running controllers
//! - [`LocalControlPlane`]: the control plane with kubeconfig and client
//! - [`System`]: runs every controller for the platform and tears it all down
//! - [`machine`]: the Machine lifecycle the infrastructure controllers drive

pub mod args;
pub mod control_plane;
pub mod controllers;
pub mod envtest;
pub mod error;
pub mod install_config;
pub mod kubeconfig;
pub mod launcher;
pub mod machine;
pub mod providers;
pub mod sessions;
pub mod system;

pub use control_plane::{ControlPlane, LocalControlPlane};
pub use controllers::{controllers_for, Controller};
pub use error::{Error, Result};
pub use install_config::{InstallConfig, Platform};
pub use kubeconfig::Kubeconfig;
pub use launcher::{ControllerLauncher, LaunchContext, ProcessLauncher};
pub use providers::{Provider, ProviderArchive};
pub use sessions::{AzureSession, CloudSessions, DefaultSessions, GcpSession};
pub use system::{System, SystemConfig};

#[cfg(test)]
pub use control_plane::MockControlPlane;
