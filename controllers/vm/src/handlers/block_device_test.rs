use crds::conditions::{Condition, ConditionSet, ConditionStatus};
use crds::virtual_machine::vm_condition;

use super::*;

fn device(name: &str, ready: bool) -> DeviceReadiness {
    DeviceReadiness {
        kind: BlockDeviceKind::VirtualDisk,
        name: name.to_string(),
        ready,
        provisioning: false,
        in_use_for_image_creation: false,
        attached_to_other_vm: false,
    }
}

#[test]
fn all_ready_yields_empty_message() {
    let summary = summarize(&[device("vd1", true), device("vd2", true)]);
    assert!(summary.all_ready());
    assert!(summary.message.is_empty());
}

#[test]
fn single_device_uses_singular_message() {
    let summary = summarize(&[device("root", false)]);
    assert_eq!(
        summary.message,
        "Waiting for block device \"root\" to be ready."
    );
}

#[test]
fn plural_message_counts_ready_over_total() {
    let summary = summarize(&[device("vd1", true), device("vd2", false), device("vd3", false)]);
    assert_eq!(summary.message, "Waiting for block devices to be ready: 1/3.");
}

#[test]
fn image_creation_use_is_categorized() {
    // One disk attached and ready, the second held by an image build.
    let mut in_use = device("vd2", false);
    in_use.in_use_for_image_creation = true;
    let summary = summarize(&[device("vd1", true), in_use]);
    assert_eq!(
        summary.message,
        "Waiting for block devices to be ready to use: 1/2; Virtual disk \"vd2\" is in use for image creation."
    );
}

#[test]
fn other_vm_use_is_categorized() {
    let mut conflicted = device("shared", false);
    conflicted.attached_to_other_vm = true;
    let summary = summarize(&[device("vd1", true), conflicted]);
    assert_eq!(
        summary.message,
        "Waiting for block devices to be ready to use: 1/2; Virtual disk \"shared\" is attached to another VirtualMachine."
    );
}

#[test]
fn provisioning_flag_survives_aggregation() {
    let mut provisioning = device("vd2", false);
    provisioning.provisioning = true;
    let summary = summarize(&[device("vd1", true), provisioning]);
    assert!(summary.any_provisioning);
}

#[test]
fn recomputing_an_unchanged_condition_does_not_churn_transition_time() {
    let devices = [device("vd1", true), device("vd2", false)];
    let mut conditions = ConditionSet::new();

    for _ in 0..2 {
        let summary = summarize(&devices);
        conditions.set(Condition {
            type_: vm_condition::TYPE_BLOCK_DEVICES_READY.to_string(),
            status: ConditionStatus::False,
            reason: vm_condition::REASON_BLOCK_DEVICES_NOT_READY.to_string(),
            message: summary.message,
            observed_generation: 1,
            last_transition_time: None,
        });
    }

    assert_eq!(conditions.len(), 1);
    let first = conditions
        .get(vm_condition::TYPE_BLOCK_DEVICES_READY)
        .and_then(|c| c.last_transition_time);
    assert!(first.is_some());

    let summary = summarize(&devices);
    conditions.set(Condition {
        type_: vm_condition::TYPE_BLOCK_DEVICES_READY.to_string(),
        status: ConditionStatus::False,
        reason: vm_condition::REASON_BLOCK_DEVICES_NOT_READY.to_string(),
        message: summary.message,
        observed_generation: 1,
        last_transition_time: None,
    });
    assert_eq!(
        conditions
            .get(vm_condition::TYPE_BLOCK_DEVICES_READY)
            .and_then(|c| c.last_transition_time),
        first
    );
}

fn status_ref(kind: BlockDeviceKind, name: &str) -> BlockDeviceStatusRef {
    BlockDeviceStatusRef {
        kind: Some(kind),
        name: name.to_string(),
        ..Default::default()
    }
}

#[test]
fn removed_ref_is_reported_stale() {
    let previous = [
        status_ref(BlockDeviceKind::VirtualDisk, "root"),
        status_ref(BlockDeviceKind::VirtualDisk, "data"),
    ];
    let current = [status_ref(BlockDeviceKind::VirtualDisk, "root")];
    assert_eq!(
        stale_refs(&previous, &current),
        vec![(BlockDeviceKind::VirtualDisk, "data".to_string())]
    );
}

#[test]
fn kept_refs_are_not_stale() {
    let refs = [
        status_ref(BlockDeviceKind::VirtualDisk, "root"),
        status_ref(BlockDeviceKind::VirtualImage, "base"),
    ];
    assert!(stale_refs(&refs, &refs).is_empty());
}

#[test]
fn same_name_under_a_different_kind_is_stale() {
    // An image and a disk may share a name; only the exact pair counts
    // as still referenced.
    let previous = [status_ref(BlockDeviceKind::VirtualImage, "ubuntu")];
    let current = [status_ref(BlockDeviceKind::ClusterVirtualImage, "ubuntu")];
    assert_eq!(
        stale_refs(&previous, &current),
        vec![(BlockDeviceKind::VirtualImage, "ubuntu".to_string())]
    );
}

#[test]
fn counter_includes_hotplug_requests() {
    use crds::virtual_machine::{CpuSpec, MemorySpec, VirtualMachineSpec};
    use crds::{
        AttachmentBlockDeviceRef, AttachmentPhase, AttachmentStatus, VirtualMachine,
        VirtualMachineBlockDeviceAttachment, VirtualMachineBlockDeviceAttachmentSpec,
    };

    let vm = VirtualMachine::new(
        "vm-a",
        VirtualMachineSpec {
            virtual_machine_class_name: "generic".into(),
            cpu: CpuSpec {
                cores: 1,
                core_fraction: String::new(),
            },
            memory: MemorySpec { size: "1Gi".into() },
            block_device_refs: vec![crds::BlockDeviceRef {
                kind: BlockDeviceKind::VirtualDisk,
                name: "root".into(),
            }],
            networks: Vec::new(),
            run_policy: Default::default(),
            virtual_machine_ip_address: String::new(),
            provisioning: None,
            usb_devices: Vec::new(),
            disruptions: None,
            os_type: Default::default(),
            bootloader: Default::default(),
            enable_paravirtualization: true,
            termination_grace_period_seconds: None,
        },
    );

    let attachment = |phase| {
        let mut a = VirtualMachineBlockDeviceAttachment::new(
            "extra",
            VirtualMachineBlockDeviceAttachmentSpec {
                virtual_machine_name: "vm-a".into(),
                block_device_ref: AttachmentBlockDeviceRef {
                    kind: BlockDeviceKind::VirtualDisk,
                    name: "extra".into(),
                },
            },
        );
        a.status = Some(AttachmentStatus {
            phase,
            ..Default::default()
        });
        a
    };

    let counter = SpecAttachmentCounter;
    assert_eq!(
        counter.count_to_attach(&vm, &[attachment(AttachmentPhase::Attached)]),
        2
    );
    // Terminal requests no longer count against the limit.
    assert_eq!(
        counter.count_to_attach(&vm, &[attachment(AttachmentPhase::Failed)]),
        1
    );
}
