//! VirtualMachine CRD
//!
//! The user-facing virtual machine resource. The spec is owned by the
//! user; the status is owned exclusively by the VM controller and is
//! recomputed from scratch on every reconcile pass.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Name of the VirtualMachineClass providing sizing and placement policy.
    pub virtual_machine_class_name: String,

    /// CPU settings.
    pub cpu: CpuSpec,

    /// Memory settings.
    pub memory: MemorySpec,

    /// Block devices to attach, in boot order.
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceRef>,

    /// Networks the machine is connected to.
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,

    /// Declared power intent.
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Name of the VirtualMachineIpAddress to bind. Empty means the
    /// controller picks the lease labeled with this VM's UID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_ip_address: String,

    /// First-boot provisioning (cloud-init style user data).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<Provisioning>,

    /// Host USB devices to pass through.
    #[serde(default)]
    pub usb_devices: Vec<UsbDeviceRef>,

    /// How disruptive spec changes are rolled out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruptions: Option<Disruptions>,

    /// Guest OS family, affects generated machine defaults.
    #[serde(default)]
    pub os_type: OsType,

    /// Firmware used to boot the guest.
    #[serde(default)]
    pub bootloader: Bootloader,

    /// Enables paravirtualized devices for the guest.
    #[serde(default = "default_true")]
    pub enable_paravirtualization: bool,

    /// Grace period before the guest is killed on stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// CPU resources of the machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    /// Number of virtual cores.
    pub cores: u32,

    /// Guaranteed share of each core, e.g. "100%".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub core_fraction: String,
}

/// Memory resources of the machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemorySpec {
    /// Requested memory size, e.g. "4Gi".
    pub size: String,
}

/// Kind of a block device reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BlockDeviceKind {
    /// Namespaced writable disk.
    VirtualDisk,

    /// Namespaced read-only image.
    VirtualImage,

    /// Cluster-scoped read-only image.
    ClusterVirtualImage,
}

impl BlockDeviceKind {
    /// Short prefix used in generated hypervisor volume names.
    pub fn volume_prefix(&self) -> &'static str {
        match self {
            BlockDeviceKind::VirtualDisk => "vd",
            BlockDeviceKind::VirtualImage => "vi",
            BlockDeviceKind::ClusterVirtualImage => "cvi",
        }
    }
}

/// Reference to a block device in the VM spec.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Kind of the referenced device.
    pub kind: BlockDeviceKind,

    /// Name of the referenced device.
    pub name: String,
}

/// Network attachment of the machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,

    /// MAC address lease bound to this attachment, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_mac_address_name: String,
}

/// Declared power intent for the machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Keep the machine running, restart it after any shutdown.
    #[default]
    AlwaysOn,

    /// Keep the machine off.
    AlwaysOff,

    /// Start and stop only on explicit user request.
    Manual,

    /// Keep running, but a clean guest shutdown is treated as an
    /// intentional stop and is not reverted.
    AlwaysOnUnlessStoppedManually,
}

/// First-boot provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provisioning {
    /// Provisioning mechanism.
    #[serde(rename = "type")]
    pub type_: ProvisioningType,

    /// Inline user data, for the UserData type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,

    /// Secret holding the user data, for the UserDataRef type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_ref: Option<ProvisioningSecretRef>,
}

/// Provisioning mechanism selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningType {
    /// Inline user data in the spec.
    UserData,

    /// User data stored in a secret.
    UserDataRef,
}

/// Reference to a provisioning secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSecretRef {
    /// Kind of the referenced object, normally "Secret".
    pub kind: String,

    /// Name of the referenced object.
    pub name: String,
}

/// Host USB device passthrough request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceRef {
    /// Name of the UsbDevice resource.
    pub name: String,
}

/// Rollout policy for disruptive spec changes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disruptions {
    /// Who approves a restart needed to apply disruptive changes.
    #[serde(default)]
    pub restart_approval_mode: RestartApprovalMode,
}

/// Restart approval mode for disruptive changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RestartApprovalMode {
    /// Disruptive changes wait for a user-triggered restart.
    #[default]
    Manual,

    /// Disruptive changes restart the machine immediately.
    Automatic,
}

/// Guest OS family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum OsType {
    /// Generic Linux/Unix guest.
    #[default]
    Generic,

    /// Windows guest, enables Hyper-V enlightenments.
    Windows,
}

/// Guest firmware.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Bootloader {
    /// Legacy BIOS boot.
    #[default]
    #[serde(rename = "BIOS")]
    Bios,

    /// UEFI boot.
    #[serde(rename = "EFI")]
    Efi,
}

/// Coarse lifecycle phase of the machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum MachinePhase {
    /// Dependencies are not ready yet.
    #[default]
    Pending,

    /// The instance is being created or scheduled.
    Starting,

    /// The guest is running.
    Running,

    /// The instance is shutting down.
    Stopping,

    /// No instance exists and none is wanted right now.
    Stopped,

    /// A live migration is in flight.
    Migrating,

    /// The machine is being deleted.
    Terminating,

    /// The instance ended up in a failed state.
    Degraded,
}

/// Observed state of one declared or hotplugged block device.
///
/// Recomputed fully on every pass, never patched incrementally.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatusRef {
    /// Kind of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BlockDeviceKind>,

    /// Name of the device.
    pub name: String,

    /// Guest-visible target device path, e.g. "sda".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    /// True when the device is attached to the running instance.
    #[serde(default)]
    pub attached: bool,

    /// True when the device was attached without a restart.
    #[serde(default)]
    pub hotplugged: bool,

    /// Size of the device, e.g. "10Gi".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    /// Name of the attachment request owning a hotplugged device.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_block_device_attachment_name: String,
}

/// Observed state of one USB device passthrough.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceStatusRef {
    /// Name of the UsbDevice resource.
    pub name: String,

    /// True when the device is attached to the running instance.
    #[serde(default)]
    pub attached: bool,

    /// True when the source device is ready for passthrough.
    #[serde(default)]
    pub ready: bool,

    /// True when the device was attached without a restart.
    #[serde(default)]
    pub hotplugged: bool,

    /// Host bus/device address, when attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<UsbAddress>,
}

/// Host USB address.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsbAddress {
    /// USB bus number.
    pub bus: u32,

    /// Device number on the bus.
    pub device: u32,
}

/// Result of a finished live migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationResult {
    /// Migration finished successfully.
    Succeeded,

    /// Migration ended with a failure.
    Failed,
}

/// Source or target location of a migrating machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmLocation {
    /// Node name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,

    /// Launcher pod name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
}

/// Mirrored live-migration state of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmMigrationState {
    /// When the migration started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// When the migration ended, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Where the machine is migrating to.
    #[serde(default)]
    pub target: VmLocation,

    /// Where the machine is migrating from.
    #[serde(default)]
    pub source: VmLocation,

    /// Outcome, once the migration ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MigrationResult>,
}

/// One spec change waiting for a user-approved restart.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Change operation: "add", "remove" or "replace".
    pub operation: String,

    /// Dotted spec path of the changed field.
    pub path: String,

    /// Last applied value, for remove/replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<serde_json::Value>,

    /// Desired value, for add/replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_value: Option<serde_json::Value>,
}

/// Observed state of a VirtualMachine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Coarse lifecycle phase.
    #[serde(default)]
    pub phase: MachinePhase,

    /// Detailed typed conditions.
    #[serde(default)]
    pub conditions: ConditionSet,

    /// Observed block devices, recomputed on every pass.
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceStatusRef>,

    /// Observed USB devices.
    #[serde(default)]
    pub usb_devices: Vec<UsbDeviceStatusRef>,

    /// Live-migration state mirrored from the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<VmMigrationState>,

    /// Spec changes deferred until a user-approved restart.
    #[serde(default)]
    pub restart_awaiting_changes: Vec<PendingChange>,

    /// Node the instance currently runs on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,

    /// IP address bound to the machine.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    /// Generation fully reflected by all conditions.
    #[serde(default)]
    pub observed_generation: i64,

    /// Debounce anchor for the volume-migration sub-protocol: volume
    /// changes are committed only after this timestamp plus the
    /// configured settle window has passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_migration_requested_at: Option<DateTime<Utc>>,
}

/// Condition types and reasons published on VirtualMachine.
pub mod vm_condition {
    /// All declared block devices are ready to attach.
    pub const TYPE_BLOCK_DEVICES_READY: &str = "BlockDevicesReady";
    /// The hypervisor machine reflects the current spec.
    pub const TYPE_CONFIGURATION_APPLIED: &str = "ConfigurationApplied";
    /// Disruptive changes wait for a restart.
    pub const TYPE_AWAITING_RESTART: &str = "AwaitingRestartToApplyConfiguration";
    /// The machine can be live-migrated.
    pub const TYPE_MIGRATABLE: &str = "Migratable";
    /// A migration is requested or running.
    pub const TYPE_MIGRATING: &str = "Migrating";
    /// The IP address lease is bound to this machine.
    pub const TYPE_IP_ADDRESS_READY: &str = "IpAddressReady";
    /// The referenced class exists and is ready.
    pub const TYPE_CLASS_READY: &str = "ClassReady";
    /// Provisioning input is resolvable.
    pub const TYPE_PROVISIONING_READY: &str = "ProvisioningReady";

    pub const REASON_BLOCK_DEVICES_READY: &str = "Ready";
    pub const REASON_BLOCK_DEVICES_NOT_READY: &str = "NotReady";
    pub const REASON_WAITING_FOR_PROVISIONING: &str = "WaitingForProvisioning";
    pub const REASON_BLOCK_DEVICE_LIMIT_EXCEEDED: &str = "LimitExceeded";

    pub const REASON_CONFIGURATION_APPLIED: &str = "ConfigurationApplied";
    pub const REASON_CONFIGURATION_NOT_APPLIED: &str = "ConfigurationNotApplied";
    pub const REASON_RESTART_NOT_NEEDED: &str = "NoNeedRestart";
    pub const REASON_RESTART_AWAITING_CHANGES: &str = "RestartAwaitingChangesExist";

    pub const REASON_MIGRATABLE: &str = "Migratable";
    pub const REASON_NON_MIGRATABLE: &str = "NonMigratable";
    pub const REASON_DISKS_SHOULD_BE_MIGRATING: &str = "DisksShouldBeMigrating";
    pub const REASON_MIGRATING_PENDING: &str = "Pending";
    pub const REASON_MIGRATING_IN_PROGRESS: &str = "InProgress";
    pub const REASON_READY_TO_MIGRATE: &str = "ReadyToMigrate";

    pub const REASON_READY: &str = "Ready";
    pub const REASON_NOT_READY: &str = "NotReady";
}

/// Annotations consumed by the VM controller.
pub mod vm_annotation {
    /// Explicit start request for a manually managed machine.
    pub const START_REQUESTED: &str = "vmops.io/start-requested";
    /// Explicit restart request.
    pub const RESTART_REQUESTED: &str = "vmops.io/restart-requested";
    /// Last VirtualMachine spec applied to the hypervisor machine.
    pub const LAST_APPLIED_SPEC: &str = "vmops.io/last-applied-spec";
}

/// Protection finalizers managed by the VM controller.
pub mod finalizer {
    /// Blocks VirtualMachine deletion until cleanup ran.
    pub const VM_CLEANUP: &str = "vmops.io/vm-protection";
    /// Blocks deletion of a disk referenced by a machine.
    pub const VD_PROTECTION: &str = "vmops.io/vd-protection";
    /// Blocks deletion of an image referenced by a machine.
    pub const VI_PROTECTION: &str = "vmops.io/vi-protection";
    /// Blocks deletion of a cluster image referenced by a machine.
    pub const CVI_PROTECTION: &str = "vmops.io/cvi-protection";
    /// Blocks VirtualMachineOperation deletion until the lower-level
    /// migration is confirmed gone.
    pub const VMOP_CLEANUP: &str = "vmops.io/vmop-cleanup";
}

/// Maximum number of block devices attachable to one machine.
pub const BLOCK_DEVICE_ATTACHED_LIMIT: usize = 16;
