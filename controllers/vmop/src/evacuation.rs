//! Node-drain evacuation.
//!
//! The hypervisor marks a live instance for eviction by filling in
//! `status.evacuationNodeName`. This watch answers with exactly one
//! Evict operation per marked machine; the operation itself then runs
//! the ordinary migration path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crds::operation::ANNOTATION_EVACUATION;
use crds::{
    HypervisorVirtualMachineInstance, OperationType, VirtualMachineOperation,
    VirtualMachineOperationSpec,
};

use crate::error::ControllerError;

/// Recheck interval while an instance stays marked for eviction.
const EVACUATION_REQUEUE: Duration = Duration::from_secs(60);

/// True when a marked instance has no migration-shaped operation
/// already covering it.
pub fn needs_evacuation_request(
    evacuation_node_name: &str,
    vm_name: &str,
    operations: &[VirtualMachineOperation],
) -> bool {
    if evacuation_node_name.is_empty() {
        return false;
    }
    !operations.iter().any(|op| {
        op.spec.virtual_machine == vm_name
            && op.spec.type_.is_migration()
            && !op
                .status
                .as_ref()
                .map(|s| s.phase)
                .unwrap_or_default()
                .is_terminal()
            && op.metadata.deletion_timestamp.is_none()
    })
}

pub struct EvacuationWatcher {
    client: Client,
}

impl EvacuationWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn reconcile(
        &self,
        hvmi: Arc<HypervisorVirtualMachineInstance>,
    ) -> Result<Action, ControllerError> {
        let name = hvmi.name_any();
        let namespace = hvmi.namespace().unwrap_or_default();

        let evacuation_node = hvmi
            .status
            .as_ref()
            .map(|s| s.evacuation_node_name.as_str())
            .unwrap_or_default();
        if evacuation_node.is_empty() {
            return Ok(Action::await_change());
        }

        let op_api: Api<VirtualMachineOperation> = Api::namespaced(self.client.clone(), &namespace);
        let operations = op_api.list(&Default::default()).await?.items;
        if !needs_evacuation_request(evacuation_node, &name, &operations) {
            debug!("instance {namespace}/{name}: eviction already requested");
            return Ok(Action::requeue(EVACUATION_REQUEUE));
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_EVACUATION.to_owned(), "true".to_owned());
        let op = VirtualMachineOperation {
            metadata: ObjectMeta {
                generate_name: Some(format!("evict-{name}-")),
                namespace: Some(namespace.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: VirtualMachineOperationSpec {
                type_: OperationType::Evict,
                virtual_machine: name.clone(),
                force: false,
            },
            status: None,
        };
        info!(
            "instance {namespace}/{name} marked for eviction from {evacuation_node}, creating \
             Evict operation"
        );
        op_api.create(&PostParams::default(), &op).await?;
        Ok(Action::requeue(EVACUATION_REQUEUE))
    }
}

#[cfg(test)]
#[path = "evacuation_test.rs"]
mod evacuation_test;
