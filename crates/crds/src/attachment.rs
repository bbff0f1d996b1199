//! VirtualMachineBlockDeviceAttachment CRD
//!
//! A hotplug request: attach an existing block device to a running
//! machine without a restart.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::virtual_machine::BlockDeviceKind;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachineBlockDeviceAttachment",
    namespaced,
    status = "AttachmentStatus",
    shortname = "vmbda"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBlockDeviceAttachmentSpec {
    /// Machine to attach the device to.
    pub virtual_machine_name: String,

    /// Device to attach.
    pub block_device_ref: AttachmentBlockDeviceRef,
}

/// Device reference inside an attachment request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentBlockDeviceRef {
    pub kind: BlockDeviceKind,
    pub name: String,
}

/// Phase of an attachment request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum AttachmentPhase {
    #[default]
    Pending,
    InProgress,
    Attached,
    Failed,
    Terminating,
}

/// Observed state of an attachment request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStatus {
    #[serde(default)]
    pub phase: AttachmentPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Machine the device is attached to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_name: String,

    #[serde(default)]
    pub observed_generation: i64,
}
