//! Underlying hypervisor CRDs, group `hypervisor.vmops.io`.
//!
//! These resources belong to the hypervisor layer beneath the VM
//! controller. `HypervisorVirtualMachine` is the desired machine
//! definition the controller writes; `HypervisorVirtualMachineInstance`
//! is the live instance it observes; `HypervisorVmMigration` drives one
//! live migration.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "hypervisor.vmops.io",
    version = "v1alpha1",
    kind = "HypervisorVirtualMachine",
    namespaced,
    status = "HvmStatus",
    shortname = "hvm"
)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorVirtualMachineSpec {
    /// Power intent at the hypervisor layer.
    #[serde(default)]
    pub run_strategy: RunStrategy,

    /// Instance template stamped out when the machine starts.
    #[serde(default)]
    pub template: HvmTemplate,

    /// How in-place volume set changes are applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_volumes_strategy: Option<UpdateVolumesStrategy>,
}

/// Hypervisor-layer power intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RunStrategy {
    /// Keep an instance running at all times.
    Always,

    /// Keep no instance.
    #[default]
    Halted,

    /// Start and stop only via explicit sub-resource calls.
    Manual,

    /// Keep running, but do not revive after a clean guest shutdown.
    RerunOnFailure,
}

/// Strategy for applying volume set changes to a running instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateVolumesStrategy {
    /// Copy volume contents to new backing storage via live migration.
    Migration,

    /// Replace volumes on the next restart.
    Replacement,
}

/// Instance template of a hypervisor machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmTemplate {
    #[serde(default)]
    pub metadata: HvmTemplateMetadata,

    #[serde(default)]
    pub spec: HvmInstanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmTemplateMetadata {
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// Desired instance: domain hardware plus volumes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmInstanceSpec {
    #[serde(default)]
    pub domain: HvmDomain,

    /// Volumes in attach order. Order matters for guest bus naming.
    #[serde(default)]
    pub volumes: Vec<HvmVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<std::collections::BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// Guest hardware definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmDomain {
    #[serde(default)]
    pub cpu: HvmCpu,

    #[serde(default)]
    pub memory: HvmMemory,

    #[serde(default)]
    pub devices: HvmDevices,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<HvmFirmware>,

    /// Paravirtualized device support for the guest.
    #[serde(default)]
    pub paravirtualization: bool,

    /// Hyper-V enlightenments for Windows guests.
    #[serde(default)]
    pub windows_features: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmCpu {
    #[serde(default)]
    pub cores: u32,

    /// Guaranteed core share, e.g. "100%".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub core_fraction: String,

    /// Guest CPU model, from the machine class.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmMemory {
    /// Guest memory size, e.g. "4Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmDevices {
    /// Disk devices, parallel to the volume list by name.
    #[serde(default)]
    pub disks: Vec<HvmDisk>,

    /// Host USB devices passed through to the guest.
    #[serde(default)]
    pub host_usb_devices: Vec<HvmHostUsbDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmDisk {
    /// Matches a volume name in the instance spec.
    pub name: String,

    /// Stable serial exposed to the guest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,

    /// Boot priority; lower boots first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HvmHostUsbDevice {
    /// UsbDevice resource name.
    pub name: String,

    /// Host bus number.
    pub bus: u32,

    /// Device number on the bus.
    pub device: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HvmFirmware {
    /// True for UEFI, false for BIOS.
    pub efi: bool,
}

/// One volume of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmVolume {
    /// Generated name, prefixed by the device kind (vd-, vi-, cvi-).
    pub name: String,

    /// PVC-backed volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<HvmPvcVolumeSource>,

    /// Registry-backed read-only volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<HvmContainerDiskSource>,

    /// Generated cloud-init volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<HvmCloudInitSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmPvcVolumeSource {
    pub claim_name: String,

    /// True when the volume was added to a running instance.
    #[serde(default)]
    pub hotpluggable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmContainerDiskSource {
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmCloudInitSource {
    /// Secret holding the rendered user data.
    pub secret_ref_name: String,
}

/// Observed state of a hypervisor machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmStatus {
    /// Printable summary phase of the machine.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub printable_status: String,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// True when an instance object exists.
    #[serde(default)]
    pub created: bool,

    /// True when the instance reports the guest running.
    #[serde(default)]
    pub ready: bool,

    /// Volume set changes waiting for restart or migration.
    #[serde(default)]
    pub volume_updates_pending: bool,

    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "hypervisor.vmops.io",
    version = "v1alpha1",
    kind = "HypervisorVirtualMachineInstance",
    namespaced,
    status = "HvmiStatus",
    shortname = "hvmi"
)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorVirtualMachineInstanceSpec {
    #[serde(default)]
    pub domain: HvmDomain,

    #[serde(default)]
    pub volumes: Vec<HvmVolume>,
}

/// Phase of a live instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum HvmiPhase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Observed state of a live instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmiStatus {
    #[serde(default)]
    pub phase: HvmiPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Node the instance runs on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Guest interface addresses; first one is the primary IP.
    #[serde(default)]
    pub interfaces: Vec<HvmiInterface>,

    /// Per-volume hotplug and migration status.
    #[serde(default)]
    pub volume_status: Vec<HvmiVolumeStatus>,

    /// Current or last migration of this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<HvmiMigrationState>,

    /// Node the scheduler asked the instance to leave, when set the
    /// instance is being evacuated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evacuation_node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmiInterface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

/// Hotplug lifecycle of one instance volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VolumePhase {
    #[default]
    Pending,
    AttachedToNode,
    MountedToPod,
    Ready,
    Detaching,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmiVolumeStatus {
    pub name: String,

    #[serde(default)]
    pub phase: VolumePhase,

    /// Guest target device, e.g. "sda".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    /// Backing PVC of the volume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub persistent_volume_claim_name: String,

    /// Set for volumes attached after instance start.
    #[serde(default)]
    pub hotplug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmiMigrationState {
    /// UID of the HypervisorVmMigration driving this migration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub migration_uid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_node: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_pod: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_node: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pod: String,

    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "hypervisor.vmops.io",
    version = "v1alpha1",
    kind = "HypervisorVmMigration",
    namespaced,
    status = "HvmMigrationStatus",
    shortname = "hvmim"
)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorVmMigrationSpec {
    /// Instance to migrate.
    pub vmi_name: String,
}

/// Phase of a hypervisor migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum HvmMigrationPhase {
    /// Not yet picked up by the hypervisor.
    #[default]
    Unset,
    Pending,
    Scheduling,
    PreparingTarget,
    TargetReady,
    Running,
    Succeeded,
    Failed,
}

impl HvmMigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HvmMigrationPhase::Succeeded | HvmMigrationPhase::Failed)
    }
}

/// Observed state of a hypervisor migration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmMigrationStatus {
    #[serde(default)]
    pub phase: HvmMigrationPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<HvmMigrationDetails>,
}

/// Progress details of a hypervisor migration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HvmMigrationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Why the migration failed, verbatim from the hypervisor.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,

    /// Volume names moved as part of this migration.
    #[serde(default)]
    pub migrated_volumes: Vec<String>,

    /// The target launcher pod cannot be scheduled.
    #[serde(default)]
    pub target_pod_unschedulable: bool,
}

/// Condition types published on a live instance.
pub mod hvmi_condition {
    /// The instance can be live-migrated.
    pub const TYPE_LIVE_MIGRATABLE: &str = "LiveMigratable";

    pub const REASON_MIGRATABLE: &str = "Migratable";
}

/// Label a hypervisor migration carries naming its instance.
pub const LABEL_MIGRATION_VMI: &str = "hypervisor.vmops.io/vmi-name";
