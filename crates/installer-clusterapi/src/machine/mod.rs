//! Machine lifecycle as driven by an external machine controller
//!
//! A [`Machine`] moves through [`Phase`]s as its [`Actuator`] creates the
//! backing instance and a Node joins. Deletion drains the node first (see
//! [`DrainController`]), waits for pre-terminate hooks, deletes the instance
//! and the Node, then drops the finalizer. The actuator holds no memory of
//! earlier calls, so every operation must be idempotent.

mod drain;
mod reconciler;

pub use drain::{DrainController, DrainOutcome, NodeDrainer, PodRef, EXCLUDE_NODE_DRAINING_ANNOTATION};
pub use reconciler::{MachineReconciler, ReconcileError, ReconcileOutcome, MACHINE_FINALIZER};

#[cfg(test)]
pub use drain::MockNodeDrainer;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Lifecycle phase of a Machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Instance creation requested
    Provisioning,
    /// Instance exists, no Node yet
    Provisioned,
    /// Node has joined
    Running,
    /// Deletion in progress
    Deleting,
    /// Terminal; the controller no longer acts on the machine
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "Provisioning",
            Self::Provisioned => "Provisioned",
            Self::Running => "Running",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Provisioning" => Ok(Self::Provisioning),
            "Provisioned" => Ok(Self::Provisioned),
            "Running" => Ok(Self::Running),
            "Deleting" => Ok(Self::Deleting),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown machine phase {other:?}")),
        }
    }
}

/// Condition types the controllers maintain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Node drained (or draining skipped) ahead of deletion
    Drained,
    /// Reconciliation paused because another API is authoritative
    Paused,
}

/// A machine status condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    /// Condition type
    pub type_: ConditionType,
    /// Whether the condition holds
    pub status: bool,
    /// Machine-readable reason
    pub reason: Option<String>,
}

impl Condition {
    /// A condition with a reason
    pub fn new(type_: ConditionType, status: bool, reason: impl Into<String>) -> Self {
        Self {
            type_,
            status,
            reason: Some(reason.into()),
        }
    }
}

/// Which API is authoritative for a machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthoritativeApi {
    /// This controller
    #[default]
    MachineApi,
    /// Cluster API took over; this controller must stay out
    ClusterApi,
    /// Ownership is being handed over
    Migrating,
}

/// The parts of a Machine resource the reconcilers read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Machine {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Current phase; `None` until first reconciled
    pub phase: Option<Phase>,
    /// Deletion timestamp is set
    pub deletion_requested: bool,
    /// Finalizers on the resource
    pub finalizers: Vec<String>,
    /// Cloud provider id once provisioned
    pub provider_id: Option<String>,
    /// Instance addresses once provisioned
    pub addresses: Vec<String>,
    /// Name of the bound Node
    pub node_ref: Option<String>,
    /// Status conditions
    pub conditions: Vec<Condition>,
    /// Names of pre-terminate lifecycle hooks still registered
    pub pre_terminate_hooks: Vec<String>,
    /// Resource annotations
    pub annotations: BTreeMap<String, String>,
    /// Which API currently owns the machine
    pub authoritative_api: AuthoritativeApi,
}

impl Machine {
    /// The condition of `type_`, if set
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the condition is set and true
    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition(type_).is_some_and(|c| c.status)
    }

    /// Whether an instance has been observed for this machine
    pub fn is_provisioned(&self) -> bool {
        self.provider_id.is_some() || !self.addresses.is_empty()
    }
}

/// Errors an actuator reports
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// The machine's configuration can never succeed; the machine fails
    #[error("invalid machine configuration: {0}")]
    InvalidConfiguration(String),

    /// Retry after a delay without treating it as a failure
    #[error("requeue in {0:?}")]
    RequeueAfter(Duration),

    /// Any other failure; retried with backoff
    #[error("{0}")]
    Other(String),
}

/// Cloud-specific instance operations, all idempotent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Create the instance for the machine
    async fn create(&self, machine: &Machine) -> Result<(), ActuatorError>;

    /// Bring the instance in line with the machine
    async fn update(&self, machine: &Machine) -> Result<(), ActuatorError>;

    /// Delete the instance
    async fn delete(&self, machine: &Machine) -> Result<(), ActuatorError>;

    /// Whether the instance exists
    async fn exists(&self, machine: &Machine) -> Result<bool, ActuatorError>;
}

/// Persistence of machine state changes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Record a new phase, with an error message for `Failed`
    async fn set_phase(
        &self,
        machine: &Machine,
        phase: Phase,
        message: Option<String>,
    ) -> crate::Result<()>;

    /// Set or replace a condition
    async fn set_condition(&self, machine: &Machine, condition: Condition) -> crate::Result<()>;

    /// Add the controller's finalizer
    async fn add_finalizer(&self, machine: &Machine) -> crate::Result<()>;

    /// Remove the controller's finalizer
    async fn remove_finalizer(&self, machine: &Machine) -> crate::Result<()>;

    /// Delete the Node bound to a machine
    async fn delete_node(&self, node: &str) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_round_trip() {
        for phase in [
            Phase::Provisioning,
            Phase::Provisioned,
            Phase::Running,
            Phase::Deleting,
            Phase::Failed,
        ] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert!("Pending".parse::<Phase>().is_err());
    }

    #[test]
    fn provisioned_means_instance_observed() {
        let mut machine = Machine::default();
        assert!(!machine.is_provisioned());
        machine.addresses.push("10.0.0.5".to_string());
        assert!(machine.is_provisioned());
    }

    #[test]
    fn condition_lookup() {
        let machine = Machine {
            conditions: vec![Condition::new(ConditionType::Drained, true, "Drained")],
            ..Machine::default()
        };
        assert!(machine.is_condition_true(ConditionType::Drained));
        assert!(!machine.is_condition_true(ConditionType::Paused));
    }
}
