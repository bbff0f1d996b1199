use crds::hypervisor::{HvmDisk, HvmPvcVolumeSource, HvmVolume, HypervisorVirtualMachine};
use crds::virtual_machine::{
    Bootloader, CpuSpec, MemorySpec, RunPolicy, VirtualMachineSpec,
};
use crds::{
    BlockDeviceKind, BlockDeviceRef, DiskPhase, VirtualDisk, VirtualDiskSpec, VirtualDiskStatus,
    VirtualMachine,
};

use super::*;

fn test_vm() -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        "web",
        VirtualMachineSpec {
            virtual_machine_class_name: "generic".into(),
            cpu: CpuSpec {
                cores: 2,
                core_fraction: String::new(),
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
            bootloader: Bootloader::Efi,
            enable_paravirtualization: true,
            termination_grace_period_seconds: None,
        },
    );
    vm.metadata.namespace = Some("default".into());
    vm
}

fn root_disk() -> ResolvedDevice {
    let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
    disk.status = Some(VirtualDiskStatus {
        phase: DiskPhase::Ready,
        target_pvc_name: "vd-root-pvc".into(),
        ..Default::default()
    });
    ResolvedDevice::Disk(disk)
}

#[test]
fn declared_disk_becomes_a_pvc_volume_with_boot_order() {
    let vm = test_vm();
    let devices = vec![(vm.spec.block_device_refs[0].clone(), Some(root_disk()))];
    let spec = build_machine_spec(&vm, None, &devices, None);

    assert_eq!(spec.run_strategy, run_strategy_for(RunPolicy::AlwaysOn));
    let volumes = &spec.template.spec.volumes;
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].name, "vd-root");
    assert_eq!(
        volumes[0]
            .persistent_volume_claim
            .as_ref()
            .map(|p| p.claim_name.as_str()),
        Some("vd-root-pvc")
    );
    let disks = &spec.template.spec.domain.devices.disks;
    assert_eq!(disks[0].boot_order, Some(1));
    assert!(spec.template.spec.domain.firmware.is_some_and(|f| f.efi));
}

#[test]
fn defaults_are_filled_in() {
    let vm = test_vm();
    let spec = build_machine_spec(&vm, None, &[], None);
    assert_eq!(spec.template.spec.domain.cpu.core_fraction, "100%");
    assert_eq!(spec.template.spec.termination_grace_period_seconds, Some(60));
}

#[test]
fn hotplugged_volumes_on_the_existing_machine_are_preserved() {
    let vm = test_vm();

    let mut existing = HypervisorVirtualMachine::new("web", Default::default());
    existing.spec.template.spec.volumes.push(HvmVolume {
        name: "vd-extra".into(),
        persistent_volume_claim: Some(HvmPvcVolumeSource {
            claim_name: "vd-extra-pvc".into(),
            hotpluggable: true,
        }),
        ..Default::default()
    });
    existing
        .spec
        .template
        .spec
        .domain
        .devices
        .disks
        .push(HvmDisk {
            name: "vd-extra".into(),
            serial: "vd-extra".into(),
            boot_order: None,
        });

    let devices = vec![(vm.spec.block_device_refs[0].clone(), Some(root_disk()))];
    let spec = build_machine_spec(&vm, None, &devices, Some(&existing));

    let names: Vec<_> = spec
        .template
        .spec
        .volumes
        .iter()
        .map(|v| v.name.as_str())
        .collect();
    assert_eq!(names, vec!["vd-root", "vd-extra"]);
    // Strategy on the existing machine wins over the policy mapping.
    assert_eq!(spec.run_strategy, existing.spec.run_strategy);
}
