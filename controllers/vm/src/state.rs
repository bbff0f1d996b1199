//! Per-pass state accessor.
//!
//! Lazily fetches and caches every object related to the machine being
//! reconciled. The cache lives for exactly one pass; nothing carries
//! over, so a retried pass always starts from fresh reads. Accessors
//! return owned clones so handlers can hold results while continuing
//! to drive the accessor.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::Client;

use crds::{
    BlockDeviceKind, BlockDeviceRef, ClusterVirtualImage, HypervisorVirtualMachine,
    HypervisorVirtualMachineInstance, UsbDevice, VirtualDisk, VirtualImage,
    VirtualMachineBlockDeviceAttachment, VirtualMachineClass, VirtualMachineIpAddress,
    VirtualMachineOperation, LABEL_VM_UID,
};

/// Label the hypervisor layer puts on launcher pods.
pub const LABEL_LAUNCHER_VM: &str = "hypervisor.vmops.io/vm-name";

/// A block device resolved to its backing resource.
#[derive(Debug, Clone)]
pub enum ResolvedDevice {
    Disk(VirtualDisk),
    Image(VirtualImage),
    ClusterImage(ClusterVirtualImage),
}

/// Lazy per-pass cache of everything related to one machine.
pub struct VmState {
    client: Client,
    namespace: String,
    name: String,
    vm_uid: String,

    hvm: Option<Option<HypervisorVirtualMachine>>,
    hvmi: Option<Option<HypervisorVirtualMachineInstance>>,
    pods: Option<Vec<Pod>>,
    disks: HashMap<String, Option<VirtualDisk>>,
    images: HashMap<String, Option<VirtualImage>>,
    cluster_images: HashMap<String, Option<ClusterVirtualImage>>,
    pvcs: HashMap<String, Option<PersistentVolumeClaim>>,
    usb_devices: HashMap<String, Option<UsbDevice>>,
    classes: HashMap<String, Option<VirtualMachineClass>>,
    attachments: Option<Vec<VirtualMachineBlockDeviceAttachment>>,
    operations: Option<Vec<VirtualMachineOperation>>,
    ip_address: Option<Option<VirtualMachineIpAddress>>,
}

impl VmState {
    pub fn new(client: Client, namespace: String, name: String, vm_uid: String) -> Self {
        Self {
            client,
            namespace,
            name,
            vm_uid,
            hvm: None,
            hvmi: None,
            pods: None,
            disks: HashMap::new(),
            images: HashMap::new(),
            cluster_images: HashMap::new(),
            pvcs: HashMap::new(),
            usb_devices: HashMap::new(),
            classes: HashMap::new(),
            attachments: None,
            operations: None,
            ip_address: None,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// The hypervisor machine, if created.
    pub async fn hvm(&mut self) -> Result<Option<HypervisorVirtualMachine>, kube::Error> {
        if self.hvm.is_none() {
            let api: Api<HypervisorVirtualMachine> = self.namespaced();
            self.hvm = Some(api.get_opt(&self.name).await?);
        }
        Ok(self.hvm.clone().unwrap_or_default())
    }

    /// The live instance, if running.
    pub async fn hvmi(
        &mut self,
    ) -> Result<Option<HypervisorVirtualMachineInstance>, kube::Error> {
        if self.hvmi.is_none() {
            let api: Api<HypervisorVirtualMachineInstance> = self.namespaced();
            self.hvmi = Some(api.get_opt(&self.name).await?);
        }
        Ok(self.hvmi.clone().unwrap_or_default())
    }

    /// Drops the cached instance so the next read refetches it.
    pub fn invalidate_hvmi(&mut self) {
        self.hvmi = None;
    }

    /// Launcher pods of this machine, newest first.
    pub async fn pods(&mut self) -> Result<Vec<Pod>, kube::Error> {
        if self.pods.is_none() {
            let api: Api<Pod> = self.namespaced();
            let params =
                ListParams::default().labels(&format!("{LABEL_LAUNCHER_VM}={}", self.name));
            let mut pods = api.list(&params).await?.items;
            pods.sort_by(|a, b| {
                b.metadata
                    .creation_timestamp
                    .cmp(&a.metadata.creation_timestamp)
            });
            self.pods = Some(pods);
        }
        Ok(self.pods.clone().unwrap_or_default())
    }

    pub async fn disk(&mut self, name: &str) -> Result<Option<VirtualDisk>, kube::Error> {
        if !self.disks.contains_key(name) {
            let api: Api<VirtualDisk> = self.namespaced();
            let disk = api.get_opt(name).await?;
            self.disks.insert(name.to_owned(), disk);
        }
        Ok(self.disks.get(name).cloned().flatten())
    }

    pub async fn image(&mut self, name: &str) -> Result<Option<VirtualImage>, kube::Error> {
        if !self.images.contains_key(name) {
            let api: Api<VirtualImage> = self.namespaced();
            let image = api.get_opt(name).await?;
            self.images.insert(name.to_owned(), image);
        }
        Ok(self.images.get(name).cloned().flatten())
    }

    pub async fn cluster_image(
        &mut self,
        name: &str,
    ) -> Result<Option<ClusterVirtualImage>, kube::Error> {
        if !self.cluster_images.contains_key(name) {
            let api: Api<ClusterVirtualImage> = Api::all(self.client.clone());
            let image = api.get_opt(name).await?;
            self.cluster_images.insert(name.to_owned(), image);
        }
        Ok(self.cluster_images.get(name).cloned().flatten())
    }

    /// Resolves a spec reference to its backing resource.
    pub async fn resolve_device(
        &mut self,
        device: &BlockDeviceRef,
    ) -> Result<Option<ResolvedDevice>, kube::Error> {
        Ok(match device.kind {
            BlockDeviceKind::VirtualDisk => {
                self.disk(&device.name).await?.map(ResolvedDevice::Disk)
            }
            BlockDeviceKind::VirtualImage => {
                self.image(&device.name).await?.map(ResolvedDevice::Image)
            }
            BlockDeviceKind::ClusterVirtualImage => self
                .cluster_image(&device.name)
                .await?
                .map(ResolvedDevice::ClusterImage),
        })
    }

    pub async fn pvc(
        &mut self,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        if !self.pvcs.contains_key(name) {
            let api: Api<PersistentVolumeClaim> = self.namespaced();
            let pvc = api.get_opt(name).await?;
            self.pvcs.insert(name.to_owned(), pvc);
        }
        Ok(self.pvcs.get(name).cloned().flatten())
    }

    pub async fn usb_device(&mut self, name: &str) -> Result<Option<UsbDevice>, kube::Error> {
        if !self.usb_devices.contains_key(name) {
            let api: Api<UsbDevice> = Api::all(self.client.clone());
            let device = api.get_opt(name).await?;
            self.usb_devices.insert(name.to_owned(), device);
        }
        Ok(self.usb_devices.get(name).cloned().flatten())
    }

    pub async fn class(
        &mut self,
        name: &str,
    ) -> Result<Option<VirtualMachineClass>, kube::Error> {
        if !self.classes.contains_key(name) {
            let api: Api<VirtualMachineClass> = Api::all(self.client.clone());
            let class = api.get_opt(name).await?;
            self.classes.insert(name.to_owned(), class);
        }
        Ok(self.classes.get(name).cloned().flatten())
    }

    /// Hotplug attachment requests targeting this machine.
    pub async fn attachments(
        &mut self,
    ) -> Result<Vec<VirtualMachineBlockDeviceAttachment>, kube::Error> {
        if self.attachments.is_none() {
            let api: Api<VirtualMachineBlockDeviceAttachment> = self.namespaced();
            let all = api.list(&ListParams::default()).await?.items;
            let mine = all
                .into_iter()
                .filter(|a| a.spec.virtual_machine_name == self.name)
                .collect();
            self.attachments = Some(mine);
        }
        Ok(self.attachments.clone().unwrap_or_default())
    }

    /// Operations targeting this machine.
    pub async fn operations(&mut self) -> Result<Vec<VirtualMachineOperation>, kube::Error> {
        if self.operations.is_none() {
            let api: Api<VirtualMachineOperation> = self.namespaced();
            let all = api.list(&ListParams::default()).await?.items;
            let mine = all
                .into_iter()
                .filter(|op| op.spec.virtual_machine == self.name)
                .collect();
            self.operations = Some(mine);
        }
        Ok(self.operations.clone().unwrap_or_default())
    }

    /// IP lease bound to this machine: the explicitly named one, or
    /// the lease labeled with this machine's UID.
    pub async fn ip_address(
        &mut self,
        spec_name: &str,
    ) -> Result<Option<VirtualMachineIpAddress>, kube::Error> {
        if self.ip_address.is_none() {
            let api: Api<VirtualMachineIpAddress> = self.namespaced();
            let found = if spec_name.is_empty() {
                let params =
                    ListParams::default().labels(&format!("{LABEL_VM_UID}={}", self.vm_uid));
                api.list(&params).await?.items.into_iter().next()
            } else {
                api.get_opt(spec_name).await?
            };
            self.ip_address = Some(found);
        }
        Ok(self.ip_address.clone().unwrap_or_default())
    }
}
