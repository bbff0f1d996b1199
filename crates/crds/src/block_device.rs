//! Block device CRDs: VirtualDisk, VirtualImage, ClusterVirtualImage.
//!
//! Only the parts the VM controller observes are modeled here. The
//! device controllers owning these resources publish the `Ready` and
//! `InUse` conditions the VM controller consumes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualDisk",
    namespaced,
    status = "VirtualDiskStatus",
    shortname = "vd"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSpec {
    /// Requested persistent volume settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<DiskPvcSpec>,
}

/// Persistent volume settings of a disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskPvcSpec {
    /// Requested size, e.g. "10Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    /// Storage class name; None means the cluster default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Phase of a VirtualDisk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum DiskPhase {
    #[default]
    Pending,
    Provisioning,
    WaitForFirstConsumer,
    WaitForUserUpload,
    Ready,
    Resizing,
    Failed,
    Terminating,
}

/// Observed state of a VirtualDisk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskStatus {
    #[serde(default)]
    pub phase: DiskPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Backing PVC name, once provisioned.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pvc_name: String,

    /// Actual capacity, e.g. "10Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub capacity: String,

    /// Names of machines this disk is attached to.
    #[serde(default)]
    pub attached_to_virtual_machines: Vec<DiskAttachmentRef>,

    /// Storage class actually used by the backing PVC.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    #[serde(default)]
    pub observed_generation: i64,
}

/// Back-reference from a disk to an attached machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskAttachmentRef {
    pub name: String,

    /// True when the disk is mounted into a running instance.
    #[serde(default)]
    pub mounted: bool,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualImage",
    namespaced,
    status = "VirtualImageStatus",
    shortname = "vi"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageSpec {
    /// How the image content is stored.
    #[serde(default)]
    pub storage: ImageStorage,
}

/// Backing storage of an image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ImageStorage {
    /// Served from the in-cluster container registry.
    #[default]
    ContainerRegistry,

    /// Backed by a PVC.
    PersistentVolumeClaim,
}

/// Phase shared by namespaced and cluster images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ImagePhase {
    #[default]
    Pending,
    Provisioning,
    WaitForUserUpload,
    Ready,
    Failed,
    Terminating,
}

/// Observed state of a VirtualImage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageStatus {
    #[serde(default)]
    pub phase: ImagePhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Unpacked image size, e.g. "2Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    /// Backing PVC name, for PVC-backed images.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pvc_name: String,

    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "ClusterVirtualImage",
    status = "ClusterVirtualImageStatus",
    shortname = "cvi"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageSpec {}

/// Observed state of a ClusterVirtualImage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageStatus {
    #[serde(default)]
    pub phase: ImagePhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Unpacked image size, e.g. "2Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    #[serde(default)]
    pub observed_generation: i64,
}

/// Condition types and reasons published on block devices.
pub mod device_condition {
    /// The device content is provisioned and attachable.
    pub const TYPE_READY: &str = "Ready";
    /// The device is held by some consumer.
    pub const TYPE_IN_USE: &str = "InUse";

    pub const REASON_READY: &str = "Ready";
    pub const REASON_PROVISIONING: &str = "Provisioning";
    pub const REASON_ATTACHED_TO_VIRTUAL_MACHINE: &str = "AttachedToVirtualMachine";
    pub const REASON_USED_FOR_IMAGE_CREATION: &str = "UsedForImageCreation";
    pub const REASON_NOT_IN_USE: &str = "NotInUse";
}
