use crds::virtual_machine::{
    BlockDeviceKind, BlockDeviceRef, CpuSpec, Disruptions, MemorySpec, RestartApprovalMode,
    RunPolicy, VirtualMachineSpec,
};

use super::compare::{DEFAULT_CORE_FRACTION, DEFAULT_GRACE_PERIOD_SECONDS};
use super::*;

fn base_spec() -> VirtualMachineSpec {
    VirtualMachineSpec {
        virtual_machine_class_name: "generic".into(),
        cpu: CpuSpec {
            cores: 2,
            core_fraction: "100%".into(),
        },
        memory: MemorySpec { size: "4Gi".into() },
        block_device_refs: vec![BlockDeviceRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".into(),
        }],
        networks: Vec::new(),
        run_policy: RunPolicy::AlwaysOn,
        virtual_machine_ip_address: String::new(),
        provisioning: None,
        usb_devices: Vec::new(),
        disruptions: None,
        os_type: Default::default(),
        bootloader: Default::default(),
        enable_paravirtualization: true,
        termination_grace_period_seconds: None,
    }
}

#[test]
fn identical_specs_produce_no_changes() {
    let spec = base_spec();
    let changes = compare_specs(&spec, &spec);
    assert!(changes.is_empty());
    assert_eq!(changes.action(), ActionType::None);
}

#[test]
fn defaults_do_not_register_as_changes() {
    let current = base_spec();
    let mut desired = base_spec();
    // Spelling out the implicit defaults must compare equal.
    desired.cpu.core_fraction = String::new();
    desired.termination_grace_period_seconds = Some(DEFAULT_GRACE_PERIOD_SECONDS);
    desired.disruptions = Some(Disruptions {
        restart_approval_mode: RestartApprovalMode::Manual,
    });
    assert!(desired.cpu.core_fraction.is_empty());
    assert_eq!(DEFAULT_CORE_FRACTION, "100%");

    let changes = compare_specs(&current, &desired);
    assert!(changes.is_empty(), "unexpected changes: {changes:?}");
}

#[test]
fn cpu_and_memory_changes_require_restart() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.cpu.cores = 4;
    desired.memory.size = "8Gi".into();

    let changes = compare_specs(&current, &desired);
    assert_eq!(changes.action(), ActionType::Restart);
    assert!(changes.is_disruptive());
    let paths: Vec<_> = changes.changes().iter().map(|c| c.path).collect();
    assert_eq!(paths, vec![".cpu.cores", ".memory.size"]);
}

#[test]
fn run_policy_change_applies_immediately() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.run_policy = RunPolicy::AlwaysOff;

    let changes = compare_specs(&current, &desired);
    assert!(!changes.is_empty());
    assert_eq!(changes.action(), ActionType::ApplyImmediate);
    assert!(!changes.is_disruptive());
}

#[test]
fn approval_mode_change_requires_nothing() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.disruptions = Some(Disruptions {
        restart_approval_mode: RestartApprovalMode::Automatic,
    });

    let changes = compare_specs(&current, &desired);
    assert!(!changes.is_empty());
    assert_eq!(changes.action(), ActionType::None);
}

#[test]
fn block_device_edit_is_disruptive_and_listed_as_pending() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.block_device_refs.push(BlockDeviceRef {
        kind: BlockDeviceKind::VirtualImage,
        name: "cdrom".into(),
    });

    let changes = compare_specs(&current, &desired);
    assert!(changes.is_disruptive());
    let pending = changes.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].path, ".blockDeviceRefs");
    assert_eq!(pending[0].operation, "replace");
    assert!(pending[0].current_value.is_some());
    assert!(pending[0].desired_value.is_some());
}

#[test]
fn restart_dominates_immediate_in_mixed_diffs() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.run_policy = RunPolicy::Manual;
    desired.virtual_machine_class_name = "highperf".into();

    let changes = compare_specs(&current, &desired);
    assert_eq!(changes.action(), ActionType::Restart);
    // Only the restart-level change lands in the pending list.
    let pending = changes.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].path, ".virtualMachineClassName");
}

#[test]
fn add_and_remove_operations_are_classified() {
    let current = base_spec();
    let mut desired = base_spec();
    desired.provisioning = Some(crds::virtual_machine::Provisioning {
        type_: crds::virtual_machine::ProvisioningType::UserData,
        user_data: "#cloud-config".into(),
        user_data_ref: None,
    });

    let changes = compare_specs(&current, &desired);
    let change = &changes.changes()[0];
    assert_eq!(change.operation, ChangeOperation::Add);
    assert!(change.current_value.is_none());

    let reverse = compare_specs(&desired, &current);
    assert_eq!(reverse.changes()[0].operation, ChangeOperation::Remove);
}
