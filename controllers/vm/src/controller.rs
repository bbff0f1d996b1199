//! Controller wiring.
//!
//! Builds the Kubernetes client, the reconciler and the watch
//! topology: the controller reconciles `VirtualMachine` objects and
//! additionally wakes up on changes to the hypervisor machine it owns,
//! the live instance, hotplug attachment requests and operations
//! targeting the machine.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller as RuntimeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crds::{
    HypervisorVirtualMachine, HypervisorVirtualMachineInstance, VirtualMachine,
    VirtualMachineBlockDeviceAttachment, VirtualMachineOperation,
};

use crate::error::ControllerError;
use crate::hypervisor_client::KubeHypervisorClient;
use crate::reconciler::Reconciler;

/// Main controller for VirtualMachine management.
pub struct Controller {
    client: Client,
    namespace: Option<String>,
    settle_window: Duration,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(
        namespace: Option<String>,
        settle_window: Duration,
    ) -> Result<Self, ControllerError> {
        info!("Initializing VirtualMachine Controller");

        let client = Client::try_default().await?;

        Ok(Self {
            client,
            namespace,
            settle_window,
        })
    }

    /// Runs the reconcile loop until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let vm_api: Api<VirtualMachine> = self.scoped_api();
        let hvm_api: Api<HypervisorVirtualMachine> = self.scoped_api();
        let hvmi_api: Api<HypervisorVirtualMachineInstance> = self.scoped_api();
        let vmbda_api: Api<VirtualMachineBlockDeviceAttachment> = self.scoped_api();
        let vmop_api: Api<VirtualMachineOperation> = self.scoped_api();

        let reconciler = Arc::new(Reconciler::new(
            self.client.clone(),
            KubeHypervisorClient::new(self.client.clone()),
            self.settle_window,
        ));

        info!("Starting VirtualMachine watch loop");

        RuntimeController::new(vm_api, watcher::Config::default())
            .owns(hvm_api, watcher::Config::default())
            // The instance and the machine share the VirtualMachine's name.
            .watches(hvmi_api, watcher::Config::default(), |hvmi| {
                let ns = hvmi.namespace()?;
                Some(ObjectRef::new(&hvmi.name_any()).within(&ns))
            })
            .watches(vmbda_api, watcher::Config::default(), |vmbda| {
                let ns = vmbda.namespace()?;
                Some(ObjectRef::new(&vmbda.spec.virtual_machine_name).within(&ns))
            })
            .watches(vmop_api, watcher::Config::default(), |vmop| {
                let ns = vmop.namespace()?;
                Some(ObjectRef::new(&vmop.spec.virtual_machine).within(&ns))
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, reconciler)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!("Reconciled VirtualMachine {}", obj.name),
                    Err(e) => warn!("Reconcile failed: {e}"),
                }
            })
            .await;

        info!("VirtualMachine controller shut down");
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

async fn reconcile(
    vm: Arc<VirtualMachine>,
    reconciler: Arc<Reconciler<KubeHypervisorClient>>,
) -> Result<Action, ControllerError> {
    reconciler.reconcile(vm).await
}

fn error_policy(
    vm: Arc<VirtualMachine>,
    error: &ControllerError,
    _reconciler: Arc<Reconciler<KubeHypervisorClient>>,
) -> Action {
    warn!(
        "Reconcile of VirtualMachine {}/{} failed: {error}",
        vm.namespace().unwrap_or_default(),
        vm.name_any()
    );
    Action::requeue(Duration::from_secs(15))
}
