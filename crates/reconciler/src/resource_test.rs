use crds::virtual_machine::{
    CpuSpec, MachinePhase, MemorySpec, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus,
};

use super::*;

fn test_vm() -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        "vm-a",
        VirtualMachineSpec {
            virtual_machine_class_name: "generic".into(),
            cpu: CpuSpec {
                cores: 2,
                core_fraction: "100%".into(),
            },
            memory: MemorySpec { size: "2Gi".into() },
            block_device_refs: Vec::new(),
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
    vm.status = Some(VirtualMachineStatus::default());
    vm
}

#[test]
fn untouched_status_is_not_marked_changed() {
    let res = ReconciledResource::new(test_vm());
    assert!(!res.status_changed().unwrap());
}

#[test]
fn mutated_status_is_marked_changed() {
    let mut res = ReconciledResource::new(test_vm());
    res.status_mut().phase = MachinePhase::Running;
    assert!(res.status_changed().unwrap());
}

#[test]
fn status_mut_creates_missing_status() {
    let mut vm = test_vm();
    vm.status = None;
    let mut res = ReconciledResource::new(vm);
    res.status_mut().phase = MachinePhase::Pending;
    assert!(res.changed.status.is_some());
    // Creating an empty default over a missing status still counts as
    // a change so the first pass initializes the subresource.
    assert!(res.status_changed().unwrap());
}
