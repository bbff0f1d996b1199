//! Desired hypervisor machine construction.
//!
//! Translates a VirtualMachine spec plus its resolved collaborators
//! (class, IP lease, block devices) into the lower-layer machine spec.
//! Hotplugged volumes and USB devices on the existing machine are
//! preserved: they are owned by the hotplug coordinator, not by the
//! synchronizer.

use std::collections::BTreeMap;

use crds::hypervisor::{
    HvmCloudInitSource, HvmContainerDiskSource, HvmCpu, HvmDevices, HvmDisk, HvmDomain,
    HvmFirmware, HvmInstanceSpec, HvmMemory, HvmPvcVolumeSource, HvmTemplate,
    HvmTemplateMetadata, HvmVolume, HypervisorVirtualMachine, HypervisorVirtualMachineSpec,
    RunStrategy,
};
use crds::virtual_machine::{
    Bootloader, OsType, ProvisioningType, RunPolicy, VirtualMachine,
};
use crds::{BlockDeviceKind, BlockDeviceRef, CpuModelType, ImageStorage, VirtualMachineClass};

use crate::state::ResolvedDevice;
use crate::vmchange::{DEFAULT_CORE_FRACTION, DEFAULT_GRACE_PERIOD_SECONDS};

/// Label the generated machine carries naming its owner.
pub const LABEL_OWNER_VM: &str = "vmops.io/virtual-machine";

/// Name of the generated cloud-init volume.
pub const CLOUD_INIT_VOLUME: &str = "cloudinit";

/// The run strategy a run policy maps to at machine creation.
///
/// The power-state enforcer keeps the strategy in sync afterwards.
pub fn run_strategy_for(policy: RunPolicy) -> RunStrategy {
    match policy {
        RunPolicy::AlwaysOn => RunStrategy::Always,
        RunPolicy::AlwaysOff => RunStrategy::Halted,
        RunPolicy::Manual => RunStrategy::Manual,
        RunPolicy::AlwaysOnUnlessStoppedManually => RunStrategy::RerunOnFailure,
    }
}

pub fn build_machine_spec(
    vm: &VirtualMachine,
    class: Option<&VirtualMachineClass>,
    devices: &[(BlockDeviceRef, Option<ResolvedDevice>)],
    existing: Option<&HypervisorVirtualMachine>,
) -> HypervisorVirtualMachineSpec {
    let spec = &vm.spec;

    let cpu_model = class
        .filter(|c| c.spec.cpu.type_ == CpuModelType::Model)
        .map(|c| c.spec.cpu.model.clone())
        .unwrap_or_default();
    let node_selector = class
        .and_then(|c| c.spec.node_selector.as_ref())
        .map(|sel| sel.match_labels.clone())
        .filter(|labels| !labels.is_empty());

    let mut volumes = Vec::new();
    let mut disks = Vec::new();
    for (index, (device_ref, resolved)) in devices.iter().enumerate() {
        let volume_name = format!("{}-{}", device_ref.kind.volume_prefix(), device_ref.name);
        let volume = match resolved {
            Some(ResolvedDevice::Disk(disk)) => {
                let claim = disk
                    .status
                    .as_ref()
                    .map(|s| s.target_pvc_name.clone())
                    .unwrap_or_default();
                HvmVolume {
                    name: volume_name.clone(),
                    persistent_volume_claim: Some(HvmPvcVolumeSource {
                        claim_name: claim,
                        hotpluggable: false,
                    }),
                    ..Default::default()
                }
            }
            Some(ResolvedDevice::Image(image)) => match image.spec.storage {
                ImageStorage::PersistentVolumeClaim => HvmVolume {
                    name: volume_name.clone(),
                    persistent_volume_claim: Some(HvmPvcVolumeSource {
                        claim_name: image
                            .status
                            .as_ref()
                            .map(|s| s.target_pvc_name.clone())
                            .unwrap_or_default(),
                        hotpluggable: false,
                    }),
                    ..Default::default()
                },
                ImageStorage::ContainerRegistry => HvmVolume {
                    name: volume_name.clone(),
                    container_disk: Some(HvmContainerDiskSource {
                        image: image_reference(device_ref, vm),
                    }),
                    ..Default::default()
                },
            },
            Some(ResolvedDevice::ClusterImage(_)) | None => HvmVolume {
                name: volume_name.clone(),
                container_disk: Some(HvmContainerDiskSource {
                    image: image_reference(device_ref, vm),
                }),
                ..Default::default()
            },
        };
        volumes.push(volume);
        disks.push(HvmDisk {
            name: volume_name.clone(),
            serial: volume_name,
            boot_order: Some(index as u32 + 1),
        });
    }

    // Cloud-init rides along as a non-bootable volume.
    if let Some(provisioning) = &spec.provisioning {
        let secret = match provisioning.type_ {
            ProvisioningType::UserDataRef => provisioning
                .user_data_ref
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_default(),
            ProvisioningType::UserData => format!("{}-cloud-init", vm_name(vm)),
        };
        let name = CLOUD_INIT_VOLUME.to_owned();
        volumes.push(HvmVolume {
            name: name.clone(),
            cloud_init: Some(HvmCloudInitSource {
                secret_ref_name: secret,
            }),
            ..Default::default()
        });
        disks.push(HvmDisk {
            name,
            serial: String::new(),
            boot_order: None,
        });
    }

    // Keep hotplugged volumes the coordinator attached earlier.
    if let Some(existing) = existing {
        for volume in &existing.spec.template.spec.volumes {
            let hotplugged = volume
                .persistent_volume_claim
                .as_ref()
                .is_some_and(|p| p.hotpluggable);
            if hotplugged && !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume.clone());
                if let Some(disk) = existing
                    .spec
                    .template
                    .spec
                    .domain
                    .devices
                    .disks
                    .iter()
                    .find(|d| d.name == volume.name)
                {
                    disks.push(disk.clone());
                }
            }
        }
    }

    let host_usb_devices = existing
        .map(|e| e.spec.template.spec.domain.devices.host_usb_devices.clone())
        .unwrap_or_default();

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_OWNER_VM.to_owned(), vm_name(vm));

    HypervisorVirtualMachineSpec {
        run_strategy: existing
            .map(|e| e.spec.run_strategy)
            .unwrap_or_else(|| run_strategy_for(spec.run_policy)),
        update_volumes_strategy: existing.and_then(|e| e.spec.update_volumes_strategy),
        template: HvmTemplate {
            metadata: HvmTemplateMetadata {
                labels,
                annotations: BTreeMap::new(),
            },
            spec: HvmInstanceSpec {
                domain: HvmDomain {
                    cpu: HvmCpu {
                        cores: spec.cpu.cores,
                        core_fraction: if spec.cpu.core_fraction.is_empty() {
                            DEFAULT_CORE_FRACTION.to_owned()
                        } else {
                            spec.cpu.core_fraction.clone()
                        },
                        model: cpu_model,
                    },
                    memory: HvmMemory {
                        size: spec.memory.size.clone(),
                    },
                    devices: HvmDevices {
                        disks,
                        host_usb_devices,
                    },
                    firmware: Some(HvmFirmware {
                        efi: spec.bootloader == Bootloader::Efi,
                    }),
                    paravirtualization: spec.enable_paravirtualization,
                    windows_features: spec.os_type == OsType::Windows,
                },
                volumes,
                node_selector,
                termination_grace_period_seconds: Some(
                    spec.termination_grace_period_seconds
                        .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS),
                ),
            },
        },
    }
}

/// Registry-style reference the hypervisor layer resolves to image
/// content.
fn image_reference(device_ref: &BlockDeviceRef, vm: &VirtualMachine) -> String {
    match device_ref.kind {
        BlockDeviceKind::ClusterVirtualImage => format!("cvi:{}", device_ref.name),
        _ => format!(
            "vi:{}/{}",
            vm.metadata.namespace.as_deref().unwrap_or_default(),
            device_ref.name
        ),
    }
}

fn vm_name(vm: &VirtualMachine) -> String {
    vm.metadata.name.clone().unwrap_or_default()
}

#[cfg(test)]
#[path = "machine_builder_test.rs"]
mod machine_builder_test;
