//! Level-triggered reconciliation of a single Machine

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    Actuator, ActuatorError, AuthoritativeApi, Condition, ConditionType, Machine, MachineStore,
    Phase,
};

/// Finalizer held until the instance and Node are gone
pub const MACHINE_FINALIZER: &str = "machine.machine.openshift.io";

/// Delay before checking again on a provisioned machine without a Node
const NODE_WAIT_REQUEUE: Duration = Duration::from_secs(20);
/// Delay before checking again on an instance that is still being deleted
const DELETE_REQUEUE: Duration = Duration::from_secs(20);
/// Delay before checking again on a machine waiting for its node to drain
const DRAIN_REQUEUE: Duration = Duration::from_secs(20);

/// What the caller should do after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing further until the machine changes
    Done,
    /// Reconcile again after the delay
    RequeueAfter(Duration),
}

/// Failures that the caller retries with its default backoff
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The actuator failed
    #[error("{operation} failed for machine {machine}: {message}")]
    Actuator {
        /// Actuator operation
        operation: &'static str,
        /// Machine name
        machine: String,
        /// Error text
        message: String,
    },

    /// Persisting state failed
    #[error("failed to update machine: {0}")]
    Store(#[from] crate::Error),
}

/// Drives one machine through its phases
pub struct MachineReconciler {
    actuator: Arc<dyn Actuator>,
    store: Arc<dyn MachineStore>,
    authoritative_api_gate: bool,
}

impl MachineReconciler {
    /// A reconciler using `actuator` for instances and `store` for state
    pub fn new(actuator: Arc<dyn Actuator>, store: Arc<dyn MachineStore>) -> Self {
        Self {
            actuator,
            store,
            authoritative_api_gate: false,
        }
    }

    /// Honor the authoritative API field and pause when another API owns
    /// the machine
    pub fn with_authoritative_api_gate(mut self, enabled: bool) -> Self {
        self.authoritative_api_gate = enabled;
        self
    }

    /// Reconcile the observed state of `machine`
    pub async fn reconcile(&self, machine: &Machine) -> Result<ReconcileOutcome, ReconcileError> {
        if self.authoritative_api_gate {
            if machine.authoritative_api != AuthoritativeApi::MachineApi {
                if !machine.is_condition_true(ConditionType::Paused) {
                    info!(machine = %machine.name, "machine is owned by another API, pausing");
                    self.store
                        .set_condition(
                            machine,
                            Condition::new(ConditionType::Paused, true, "AuthoritativeAPINotMachineAPI"),
                        )
                        .await?;
                }
                return Ok(ReconcileOutcome::Done);
            }
            if machine.is_condition_true(ConditionType::Paused) {
                self.store
                    .set_condition(
                        machine,
                        Condition::new(ConditionType::Paused, false, "AuthoritativeAPIMachineAPI"),
                    )
                    .await?;
            }
        }

        if machine.deletion_requested {
            return self.reconcile_delete(machine).await;
        }

        if !machine.finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            self.store.add_finalizer(machine).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if machine.phase == Some(Phase::Failed) {
            debug!(machine = %machine.name, "machine has failed, nothing to do");
            return Ok(ReconcileOutcome::Done);
        }

        let exists = match self.actuator.exists(machine).await {
            Ok(exists) => exists,
            Err(e) => return self.actuator_failure(machine, "exists", e).await,
        };

        if exists {
            if let Err(e) = self.actuator.update(machine).await {
                return self.actuator_failure(machine, "update", e).await;
            }
            let phase = if machine.node_ref.is_some() {
                Phase::Running
            } else {
                Phase::Provisioned
            };
            self.transition(machine, phase, None).await?;
            return Ok(match phase {
                Phase::Provisioned => ReconcileOutcome::RequeueAfter(NODE_WAIT_REQUEUE),
                _ => ReconcileOutcome::Done,
            });
        }

        if machine.is_provisioned() {
            warn!(machine = %machine.name, "instance vanished after provisioning");
            self.transition(
                machine,
                Phase::Failed,
                Some("can't find created instance".to_string()),
            )
            .await?;
            return Ok(ReconcileOutcome::Done);
        }

        self.transition(machine, Phase::Provisioning, None).await?;
        match self.actuator.create(machine).await {
            Ok(()) => {
                info!(machine = %machine.name, "created instance");
                Ok(ReconcileOutcome::RequeueAfter(Duration::ZERO))
            }
            Err(e) => self.actuator_failure(machine, "create", e).await,
        }
    }

    async fn reconcile_delete(&self, machine: &Machine) -> Result<ReconcileOutcome, ReconcileError> {
        self.transition(machine, Phase::Deleting, None).await?;

        if machine.node_ref.is_some() && !machine.is_condition_true(ConditionType::Drained) {
            debug!(machine = %machine.name, "waiting for node to drain");
            return Ok(ReconcileOutcome::RequeueAfter(DRAIN_REQUEUE));
        }

        if !machine.pre_terminate_hooks.is_empty() {
            debug!(
                machine = %machine.name,
                hooks = ?machine.pre_terminate_hooks,
                "waiting for pre-terminate hooks"
            );
            return Ok(ReconcileOutcome::Done);
        }

        if let Err(e) = self.actuator.delete(machine).await {
            return self.actuator_failure(machine, "delete", e).await;
        }
        match self.actuator.exists(machine).await {
            Ok(true) => {
                debug!(machine = %machine.name, "instance still exists");
                return Ok(ReconcileOutcome::RequeueAfter(DELETE_REQUEUE));
            }
            Ok(false) => {}
            Err(e) => return self.actuator_failure(machine, "exists", e).await,
        }

        if let Some(node) = &machine.node_ref {
            self.store.delete_node(node).await?;
        }
        if machine.finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            self.store.remove_finalizer(machine).await?;
        }
        info!(machine = %machine.name, "machine deleted");
        Ok(ReconcileOutcome::Done)
    }

    async fn transition(
        &self,
        machine: &Machine,
        phase: Phase,
        message: Option<String>,
    ) -> Result<(), ReconcileError> {
        if machine.phase != Some(phase) {
            debug!(machine = %machine.name, from = ?machine.phase, to = %phase, "phase transition");
            self.store.set_phase(machine, phase, message).await?;
        }
        Ok(())
    }

    async fn actuator_failure(
        &self,
        machine: &Machine,
        operation: &'static str,
        error: ActuatorError,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match error {
            ActuatorError::InvalidConfiguration(message) if operation != "delete" => {
                warn!(machine = %machine.name, operation, %message, "invalid configuration");
                self.transition(machine, Phase::Failed, Some(message)).await?;
                Ok(ReconcileOutcome::Done)
            }
            ActuatorError::RequeueAfter(after) => Ok(ReconcileOutcome::RequeueAfter(after)),
            other => Err(ReconcileError::Actuator {
                operation,
                machine: machine.name.clone(),
                message: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MockActuator, MockMachineStore};
    use mockall::predicate::*;

    fn machine() -> Machine {
        Machine {
            name: "worker-0".to_string(),
            namespace: "openshift-machine-api".to_string(),
            finalizers: vec![MACHINE_FINALIZER.to_string()],
            ..Machine::default()
        }
    }

    fn reconciler(actuator: MockActuator, store: MockMachineStore) -> MachineReconciler {
        MachineReconciler::new(Arc::new(actuator), Arc::new(store))
    }

    #[tokio::test]
    async fn adds_finalizer_first() {
        let actuator = MockActuator::new();
        let mut store = MockMachineStore::new();
        store.expect_add_finalizer().times(1).returning(|_| Ok(()));

        let m = Machine {
            finalizers: vec![],
            ..machine()
        };
        let outcome = reconciler(actuator, store).reconcile(&m).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn new_machine_is_created_in_provisioning() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(false));
        actuator.expect_create().times(1).returning(|_| Ok(()));
        let mut store = MockMachineStore::new();
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Provisioning), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let outcome = reconciler(actuator, store).reconcile(&machine()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(Duration::ZERO));
    }

    #[tokio::test]
    async fn invalid_configuration_fails_machine() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(false));
        actuator
            .expect_create()
            .returning(|_| Err(ActuatorError::InvalidConfiguration("bad instance type".into())));
        let mut store = MockMachineStore::new();
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Provisioning), eq(None))
            .returning(|_, _, _| Ok(()));
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Failed), eq(Some("bad instance type".to_string())))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let outcome = reconciler(actuator, store).reconcile(&machine()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn requeue_after_is_not_a_failure() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(false));
        actuator
            .expect_create()
            .returning(|_| Err(ActuatorError::RequeueAfter(Duration::from_secs(30))));
        let mut store = MockMachineStore::new();
        store.expect_set_phase().returning(|_, _, _| Ok(()));

        let m = Machine {
            phase: Some(Phase::Provisioning),
            ..machine()
        };
        let outcome = reconciler(actuator, store).reconcile(&m).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn other_errors_are_returned() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(false));
        actuator
            .expect_create()
            .returning(|_| Err(ActuatorError::Other("throttled".into())));
        let mut store = MockMachineStore::new();
        store.expect_set_phase().returning(|_, _, _| Ok(()));

        let err = reconciler(actuator, store).reconcile(&machine()).await.unwrap_err();
        assert!(err.to_string().contains("throttled"));
    }

    #[tokio::test]
    async fn existing_instance_moves_to_provisioned_then_running() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(true));
        actuator.expect_update().times(2).returning(|_| Ok(()));
        let mut store = MockMachineStore::new();
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Provisioned), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Running), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let r = reconciler(actuator, store);

        let provisioned = Machine {
            phase: Some(Phase::Provisioning),
            provider_id: Some("aws:///us-east-1a/i-123".to_string()),
            ..machine()
        };
        assert_eq!(
            r.reconcile(&provisioned).await.unwrap(),
            ReconcileOutcome::RequeueAfter(NODE_WAIT_REQUEUE)
        );

        let running = Machine {
            phase: Some(Phase::Provisioned),
            node_ref: Some("worker-0-node".to_string()),
            ..provisioned
        };
        assert_eq!(r.reconcile(&running).await.unwrap(), ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn vanished_instance_fails_machine() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(false));
        actuator.expect_create().never();
        let mut store = MockMachineStore::new();
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Failed), always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let m = Machine {
            phase: Some(Phase::Running),
            provider_id: Some("gce://p/z/i".to_string()),
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn failed_machine_is_left_alone() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().never();
        let store = MockMachineStore::new();
        let m = Machine {
            phase: Some(Phase::Failed),
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn deletion_waits_for_drain() {
        let mut actuator = MockActuator::new();
        actuator.expect_delete().never();
        let mut store = MockMachineStore::new();
        store
            .expect_set_phase()
            .with(always(), eq(Phase::Deleting), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let m = Machine {
            phase: Some(Phase::Running),
            deletion_requested: true,
            node_ref: Some("node-a".to_string()),
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::RequeueAfter(DRAIN_REQUEUE)
        );
    }

    #[tokio::test]
    async fn deletion_waits_for_pre_terminate_hooks() {
        let mut actuator = MockActuator::new();
        actuator.expect_delete().never();
        let store = MockMachineStore::new();

        let m = Machine {
            phase: Some(Phase::Deleting),
            deletion_requested: true,
            pre_terminate_hooks: vec!["etcd-quorum".to_string()],
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn deletion_removes_instance_node_and_finalizer() {
        let mut actuator = MockActuator::new();
        actuator.expect_delete().times(1).returning(|_| Ok(()));
        actuator.expect_exists().times(1).returning(|_| Ok(false));
        let mut store = MockMachineStore::new();
        store
            .expect_delete_node()
            .with(eq("node-a"))
            .times(1)
            .returning(|_| Ok(()));
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));

        let m = Machine {
            phase: Some(Phase::Deleting),
            deletion_requested: true,
            node_ref: Some("node-a".to_string()),
            conditions: vec![Condition::new(ConditionType::Drained, true, "Drained")],
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn deletion_requeues_while_instance_exists() {
        let mut actuator = MockActuator::new();
        actuator.expect_delete().returning(|_| Ok(()));
        actuator.expect_exists().returning(|_| Ok(true));
        let mut store = MockMachineStore::new();
        store.expect_remove_finalizer().never();

        let m = Machine {
            phase: Some(Phase::Deleting),
            deletion_requested: true,
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::RequeueAfter(DELETE_REQUEUE)
        );
    }

    #[tokio::test]
    async fn authoritative_gate_pauses_foreign_machines() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().never();
        let mut store = MockMachineStore::new();
        store
            .expect_set_condition()
            .withf(|_, c| c.type_ == ConditionType::Paused && c.status)
            .times(1)
            .returning(|_, _| Ok(()));

        let m = Machine {
            authoritative_api: AuthoritativeApi::ClusterApi,
            ..machine()
        };
        let outcome = reconciler(actuator, store)
            .with_authoritative_api_gate(true)
            .reconcile(&m)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn authoritative_field_ignored_without_gate() {
        let mut actuator = MockActuator::new();
        actuator.expect_exists().returning(|_| Ok(true));
        actuator.expect_update().returning(|_| Ok(()));
        let mut store = MockMachineStore::new();
        store.expect_set_condition().never();
        store.expect_set_phase().returning(|_, _, _| Ok(()));

        let m = Machine {
            authoritative_api: AuthoritativeApi::ClusterApi,
            node_ref: Some("n".to_string()),
            ..machine()
        };
        assert_eq!(
            reconciler(actuator, store).reconcile(&m).await.unwrap(),
            ReconcileOutcome::Done
        );
    }
}
