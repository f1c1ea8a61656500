//! Node draining ahead of machine deletion
//!
//! Sets the Drained condition once every evictable pod has left the node.
//! Evictions refused by a PodDisruptionBudget are retried on the next pass.
//! On an unreachable node, pods already terminating are not waited for since
//! their kubelet will never confirm them gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use super::{Condition, ConditionType, Machine, MachineStore};
use crate::error::Result;

/// Annotation that skips draining for a machine
pub const EXCLUDE_NODE_DRAINING_ANNOTATION: &str = "machine.openshift.io/exclude-node-draining";

/// Delay between drain passes while pods remain
const DRAIN_RETRY: Duration = Duration::from_secs(20);

/// A pod scheduled on the node being drained
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Owned by a DaemonSet; left in place
    pub daemon_set: bool,
    /// Static mirror pod; cannot be evicted
    pub mirror: bool,
    /// Deletion timestamp is set
    pub terminating: bool,
}

/// Node operations needed to drain
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeDrainer: Send + Sync {
    /// Whether the node's kubelet is reporting Ready
    async fn node_ready(&self, node: &str) -> Result<bool>;

    /// Mark the node unschedulable
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Pods currently bound to the node
    async fn pods_on(&self, node: &str) -> Result<Vec<PodRef>>;

    /// Request eviction; `Ok(false)` when a disruption budget refuses it
    async fn evict(&self, pod: &PodRef) -> Result<bool>;
}

/// Result of one drain pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Node drained or draining not needed
    Done,
    /// Pods remain; run again after the delay
    RequeueAfter(Duration),
}

/// Maintains the Drained condition of machines being deleted
pub struct DrainController {
    drainer: Arc<dyn NodeDrainer>,
    store: Arc<dyn MachineStore>,
}

impl DrainController {
    /// A controller draining through `drainer` and recording into `store`
    pub fn new(drainer: Arc<dyn NodeDrainer>, store: Arc<dyn MachineStore>) -> Self {
        Self { drainer, store }
    }

    /// Run one drain pass for `machine`
    pub async fn reconcile(&self, machine: &Machine) -> Result<DrainOutcome> {
        if !machine.deletion_requested || machine.is_condition_true(ConditionType::Drained) {
            return Ok(DrainOutcome::Done);
        }

        let Some(node) = machine.node_ref.as_deref() else {
            self.mark_drained(machine, "NodeNotFound").await?;
            return Ok(DrainOutcome::Done);
        };
        if machine
            .annotations
            .contains_key(EXCLUDE_NODE_DRAINING_ANNOTATION)
        {
            info!(machine = %machine.name, node, "node draining excluded");
            self.mark_drained(machine, "DrainSkipped").await?;
            return Ok(DrainOutcome::Done);
        }

        let unreachable = !self.drainer.node_ready(node).await?;
        self.drainer.cordon(node).await?;

        let mut remaining = 0usize;
        for pod in self.drainer.pods_on(node).await? {
            if pod.daemon_set || pod.mirror {
                continue;
            }
            if pod.terminating {
                if !unreachable {
                    remaining += 1;
                }
                continue;
            }
            if !self.drainer.evict(&pod).await? {
                debug!(pod = %pod.name, namespace = %pod.namespace, "eviction refused by disruption budget");
            }
            remaining += 1;
        }

        if remaining == 0 {
            info!(machine = %machine.name, node, "node drained");
            self.mark_drained(machine, "Drained").await?;
            return Ok(DrainOutcome::Done);
        }

        debug!(machine = %machine.name, node, remaining, "waiting for pods to leave node");
        if machine.condition(ConditionType::Drained).is_none() {
            self.store
                .set_condition(machine, Condition::new(ConditionType::Drained, false, "Draining"))
                .await?;
        }
        Ok(DrainOutcome::RequeueAfter(DRAIN_RETRY))
    }

    async fn mark_drained(&self, machine: &Machine, reason: &str) -> Result<()> {
        self.store
            .set_condition(machine, Condition::new(ConditionType::Drained, true, reason))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MockMachineStore;

    fn deleting(node: Option<&str>) -> Machine {
        Machine {
            name: "worker-1".to_string(),
            deletion_requested: true,
            node_ref: node.map(str::to_string),
            ..Machine::default()
        }
    }

    fn pod(name: &str) -> PodRef {
        PodRef {
            namespace: "default".to_string(),
            name: name.to_string(),
            ..PodRef::default()
        }
    }

    fn expect_drained(store: &mut MockMachineStore, status: bool, reason: &'static str) {
        store
            .expect_set_condition()
            .withf(move |_, c| {
                c.type_ == ConditionType::Drained
                    && c.status == status
                    && c.reason.as_deref() == Some(reason)
            })
            .times(1)
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn machine_not_deleting_is_ignored() {
        let controller = DrainController::new(
            Arc::new(MockNodeDrainer::new()),
            Arc::new(MockMachineStore::new()),
        );
        let machine = Machine::default();
        assert_eq!(controller.reconcile(&machine).await.unwrap(), DrainOutcome::Done);
    }

    #[tokio::test]
    async fn missing_node_counts_as_drained() {
        let mut store = MockMachineStore::new();
        expect_drained(&mut store, true, "NodeNotFound");
        let controller = DrainController::new(Arc::new(MockNodeDrainer::new()), Arc::new(store));
        assert_eq!(
            controller.reconcile(&deleting(None)).await.unwrap(),
            DrainOutcome::Done
        );
    }

    #[tokio::test]
    async fn exclusion_annotation_skips_drain() {
        let mut store = MockMachineStore::new();
        expect_drained(&mut store, true, "DrainSkipped");
        let mut drainer = MockNodeDrainer::new();
        drainer.expect_cordon().never();
        let controller = DrainController::new(Arc::new(drainer), Arc::new(store));

        let mut machine = deleting(Some("node-1"));
        machine
            .annotations
            .insert(EXCLUDE_NODE_DRAINING_ANNOTATION.to_string(), String::new());
        assert_eq!(controller.reconcile(&machine).await.unwrap(), DrainOutcome::Done);
    }

    #[tokio::test]
    async fn evicts_and_waits_for_pods() {
        let mut drainer = MockNodeDrainer::new();
        drainer.expect_node_ready().returning(|_| Ok(true));
        drainer.expect_cordon().times(1).returning(|_| Ok(()));
        drainer.expect_pods_on().returning(|_| {
            Ok(vec![
                pod("web"),
                PodRef {
                    daemon_set: true,
                    ..pod("node-exporter")
                },
                PodRef {
                    mirror: true,
                    ..pod("kube-proxy")
                },
            ])
        });
        drainer
            .expect_evict()
            .withf(|p| p.name == "web")
            .times(1)
            .returning(|_| Ok(false));
        let mut store = MockMachineStore::new();
        expect_drained(&mut store, false, "Draining");
        let controller = DrainController::new(Arc::new(drainer), Arc::new(store));

        assert_eq!(
            controller.reconcile(&deleting(Some("node-1"))).await.unwrap(),
            DrainOutcome::RequeueAfter(DRAIN_RETRY)
        );
    }

    #[tokio::test]
    async fn unreachable_node_skips_terminating_pods() {
        let mut drainer = MockNodeDrainer::new();
        drainer.expect_node_ready().returning(|_| Ok(false));
        drainer.expect_cordon().returning(|_| Ok(()));
        drainer.expect_pods_on().returning(|_| {
            Ok(vec![PodRef {
                terminating: true,
                ..pod("stuck")
            }])
        });
        drainer.expect_evict().never();
        let mut store = MockMachineStore::new();
        expect_drained(&mut store, true, "Drained");
        let controller = DrainController::new(Arc::new(drainer), Arc::new(store));

        assert_eq!(
            controller.reconcile(&deleting(Some("node-1"))).await.unwrap(),
            DrainOutcome::Done
        );
    }

    #[tokio::test]
    async fn reachable_node_waits_for_terminating_pods() {
        let mut drainer = MockNodeDrainer::new();
        drainer.expect_node_ready().returning(|_| Ok(true));
        drainer.expect_cordon().returning(|_| Ok(()));
        drainer.expect_pods_on().returning(|_| {
            Ok(vec![PodRef {
                terminating: true,
                ..pod("slow")
            }])
        });
        let mut store = MockMachineStore::new();
        expect_drained(&mut store, false, "Draining");
        let controller = DrainController::new(Arc::new(drainer), Arc::new(store));

        assert_eq!(
            controller.reconcile(&deleting(Some("node-1"))).await.unwrap(),
            DrainOutcome::RequeueAfter(DRAIN_RETRY)
        );
    }
}
