//! UsbDevice CRD
//!
//! Cluster-scoped inventory record of a host USB device discovered by
//! the node agent. The VM controller gates passthrough on readiness
//! and single-consumer ownership.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "UsbDevice",
    status = "UsbDeviceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceSpec {}

/// Phase of a USB device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum UsbDevicePhase {
    #[default]
    Pending,
    Ready,
    Terminating,
}

/// Observed state of a USB device.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceStatus {
    #[serde(default)]
    pub phase: UsbDevicePhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Node the physical device is plugged into.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Vendor-assigned identifier, e.g. "1d6b".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor_id: String,

    /// Product identifier, e.g. "0002".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_id: String,

    /// USB bus number on the host.
    #[serde(default)]
    pub bus: u32,

    /// Device number on the bus.
    #[serde(default)]
    pub device_number: u32,

    /// Machine currently consuming the device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<UsbAttachmentRef>,

    #[serde(default)]
    pub observed_generation: i64,
}

/// Machine consuming a USB device.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbAttachmentRef {
    pub name: String,
    pub namespace: String,
}

/// Condition types published on a USB device.
pub mod usb_condition {
    /// The device is present and exclusively claimable.
    pub const TYPE_READY: &str = "Ready";

    pub const REASON_READY: &str = "Ready";
    pub const REASON_NOT_READY: &str = "NotReady";
}
