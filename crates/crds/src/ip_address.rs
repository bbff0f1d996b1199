//! VirtualMachineIpAddress CRD
//!
//! IP lease bound to a machine. The VM controller only consumes the
//! bound address and the Bound condition; lease management is owned by
//! the IPAM controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachineIpAddress",
    namespaced,
    status = "IpAddressStatus",
    shortname = "vmip"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIpAddressSpec {
    /// Lease type.
    #[serde(rename = "type", default)]
    pub type_: IpAddressType,

    /// Requested address, for Static leases.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub static_ip: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum IpAddressType {
    #[default]
    Auto,
    Static,
}

/// Phase of an IP lease.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum IpAddressPhase {
    #[default]
    Pending,
    Bound,
    Attached,
}

/// Observed state of an IP lease.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IpAddressStatus {
    #[serde(default)]
    pub phase: IpAddressPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// The leased address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// Machine the lease is bound to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_name: String,

    #[serde(default)]
    pub observed_generation: i64,
}

/// Condition types published on an IP lease.
pub mod ip_condition {
    /// The lease holds an address.
    pub const TYPE_BOUND: &str = "Bound";

    pub const REASON_BOUND: &str = "Bound";
}

/// Label selecting the lease pre-bound to a machine's UID.
pub const LABEL_VM_UID: &str = "vmops.io/virtual-machine-uid";
