//! Controller wiring.
//!
//! Two loops run side by side: the primary one reconciles
//! `VirtualMachineOperation` objects and additionally wakes up when
//! the same-named hypervisor migration changes; the secondary one
//! watches live instances and issues Evict operations during node
//! drain.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller as RuntimeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crds::{HypervisorVirtualMachineInstance, HypervisorVmMigration, VirtualMachineOperation};

use crate::error::ControllerError;
use crate::evacuation::EvacuationWatcher;
use crate::reconciler::OpReconciler;

/// Main controller for VirtualMachineOperation management.
pub struct Controller {
    client: Client,
    namespace: Option<String>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing VirtualMachineOperation Controller");

        let client = Client::try_default().await?;

        Ok(Self { client, namespace })
    }

    /// Runs both watch loops until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let vmop_api: Api<VirtualMachineOperation> = self.scoped_api();
        let migration_api: Api<HypervisorVmMigration> = self.scoped_api();
        let hvmi_api: Api<HypervisorVirtualMachineInstance> = self.scoped_api();

        let op_reconciler = Arc::new(OpReconciler::new(self.client.clone()));
        let evacuation = Arc::new(EvacuationWatcher::new(self.client.clone()));

        info!("Starting VirtualMachineOperation watch loops");

        let operations = RuntimeController::new(vmop_api, watcher::Config::default())
            // The migration carries the operation's name.
            .watches(migration_api, watcher::Config::default(), |migration| {
                let ns = migration.namespace()?;
                Some(ObjectRef::new(&migration.name_any()).within(&ns))
            })
            .shutdown_on_signal()
            .run(reconcile_operation, operation_error_policy, op_reconciler)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!("Reconciled VirtualMachineOperation {}", obj.name),
                    Err(e) => warn!("Reconcile failed: {e}"),
                }
            });

        let evictions = RuntimeController::new(hvmi_api, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile_instance, instance_error_policy, evacuation)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!("Checked instance {} for evacuation", obj.name),
                    Err(e) => warn!("Evacuation check failed: {e}"),
                }
            });

        tokio::join!(operations, evictions);

        info!("VirtualMachineOperation controller shut down");
        Ok(())
    }

    fn scoped_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

async fn reconcile_operation(
    op: Arc<VirtualMachineOperation>,
    reconciler: Arc<OpReconciler>,
) -> Result<Action, ControllerError> {
    reconciler.reconcile(op).await
}

fn operation_error_policy(
    op: Arc<VirtualMachineOperation>,
    error: &ControllerError,
    _reconciler: Arc<OpReconciler>,
) -> Action {
    warn!(
        "Reconcile of VirtualMachineOperation {}/{} failed: {error}",
        op.namespace().unwrap_or_default(),
        op.name_any()
    );
    Action::requeue(Duration::from_secs(15))
}

async fn reconcile_instance(
    hvmi: Arc<HypervisorVirtualMachineInstance>,
    watcher: Arc<EvacuationWatcher>,
) -> Result<Action, ControllerError> {
    watcher.reconcile(hvmi).await
}

fn instance_error_policy(
    hvmi: Arc<HypervisorVirtualMachineInstance>,
    error: &ControllerError,
    _watcher: Arc<EvacuationWatcher>,
) -> Action {
    warn!(
        "Evacuation check for instance {}/{} failed: {error}",
        hvmi.namespace().unwrap_or_default(),
        hvmi.name_any()
    );
    Action::requeue(Duration::from_secs(15))
}
