//! Narrow client for the hypervisor layer.
//!
//! All writes the handler chain performs against the lower
//! virtualization level go through [`HypervisorClient`]; tests inject
//! a recording fake instead of a live API server.

use chrono::Utc;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;

use crds::hypervisor::{
    HvmDisk, HvmHostUsbDevice, HvmVolume, HypervisorVirtualMachine,
    HypervisorVirtualMachineInstance, RunStrategy,
};

/// One power action requested from the hypervisor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Start,
    Stop,
    Restart,
}

impl PowerRequest {
    fn as_str(&self) -> &'static str {
        match self {
            PowerRequest::Start => "start",
            PowerRequest::Stop => "stop",
            PowerRequest::Restart => "restart",
        }
    }
}

/// Annotation the hypervisor layer consumes as a one-shot power signal.
pub const ANNOTATION_POWER_REQUEST: &str = "hypervisor.vmops.io/power-request";

/// Subresource-style calls against an existing hypervisor machine.
pub trait HypervisorClient {
    /// Signals a one-shot power action.
    fn request_power(
        &self,
        namespace: &str,
        name: &str,
        request: PowerRequest,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Patches the run strategy. Callers only invoke this on an actual
    /// difference, redundant writes are a protocol violation.
    fn patch_run_strategy(
        &self,
        namespace: &str,
        name: &str,
        strategy: RunStrategy,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Deletes the live instance, forcing the machine down.
    fn delete_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Replaces the machine's volume and disk lists (hotplug and
    /// volume migration both go through here).
    fn update_volumes(
        &self,
        namespace: &str,
        name: &str,
        volumes: &[HvmVolume],
        disks: &[HvmDisk],
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Replaces the machine's host USB device list.
    fn update_usb_devices(
        &self,
        namespace: &str,
        name: &str,
        devices: &[HvmHostUsbDevice],
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;
}

/// Live implementation backed by the cluster API.
#[derive(Clone)]
pub struct KubeHypervisorClient {
    client: Client,
}

impl KubeHypervisorClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn hvm_api(&self, namespace: &str) -> Api<HypervisorVirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl HypervisorClient for KubeHypervisorClient {
    async fn request_power(
        &self,
        namespace: &str,
        name: &str,
        request: PowerRequest,
    ) -> Result<(), kube::Error> {
        // The timestamp makes repeated identical requests distinct so
        // the lower layer sees each one.
        let value = format!("{}/{}", request.as_str(), Utc::now().to_rfc3339());
        let patch = json!({
            "metadata": { "annotations": { ANNOTATION_POWER_REQUEST: value } }
        });
        self.hvm_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_run_strategy(
        &self,
        namespace: &str,
        name: &str,
        strategy: RunStrategy,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "spec": { "runStrategy": strategy } });
        self.hvm_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<HypervisorVirtualMachineInstance> =
            Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is the desired outcome.
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update_volumes(
        &self,
        namespace: &str,
        name: &str,
        volumes: &[HvmVolume],
        disks: &[HvmDisk],
    ) -> Result<(), kube::Error> {
        let patch = json!({
            "spec": { "template": { "spec": {
                "volumes": volumes,
                "domain": { "devices": { "disks": disks } }
            } } }
        });
        self.hvm_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_usb_devices(
        &self,
        namespace: &str,
        name: &str,
        devices: &[HvmHostUsbDevice],
    ) -> Result<(), kube::Error> {
        let patch = json!({
            "spec": { "template": { "spec": {
                "domain": { "devices": { "hostUsbDevices": devices } }
            } } }
        });
        self.hvm_api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
