//! Hotplug/Device Coordinator.
//!
//! Reconciles the device set actually attached to the hypervisor
//! machine (hotplugged disks and images, host USB devices) against the
//! desired set. Attach and detach both go through the volume-list
//! update call; idempotence comes from diffing, a request already
//! reflected in the machine spec is never re-issued.

use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crds::block_device::device_condition;
use crds::hypervisor::{HvmDisk, HvmHostUsbDevice, HvmPvcVolumeSource, HvmVolume};
use crds::virtual_machine::{vm_condition, UsbAddress, UsbDeviceStatusRef};
use crds::{
    AttachmentPhase, ImageStorage, UsbDevice, UsbDevicePhase,
    VirtualMachineBlockDeviceAttachment,
};
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::hypervisor_client::HypervisorClient;
use crate::state::ResolvedDevice;

use super::machine_builder::CLOUD_INIT_VOLUME;
use super::VmContext;

/// What to do with the host USB device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbAction {
    Keep,

    /// A migration is outstanding; passthrough devices pin the machine
    /// to its node and must come off first.
    DetachAll,

    Replace(Vec<HvmHostUsbDevice>),
}

/// Pure USB decision over the desired and current passthrough sets.
pub fn plan_usb(
    desired: &[HvmHostUsbDevice],
    current: &[HvmHostUsbDevice],
    migration_outstanding: bool,
) -> UsbAction {
    if migration_outstanding {
        if current.is_empty() {
            return UsbAction::Keep;
        }
        return UsbAction::DetachAll;
    }
    if desired == current {
        UsbAction::Keep
    } else {
        UsbAction::Replace(desired.to_vec())
    }
}

/// Splits a machine's volumes into the declared base set and the
/// hotplugged tail.
pub fn split_hotplug_volumes(
    volumes: &[HvmVolume],
    declared: &[String],
) -> (Vec<HvmVolume>, Vec<HvmVolume>) {
    let mut base = Vec::new();
    let mut hotplug = Vec::new();
    for volume in volumes {
        if volume.name == CLOUD_INIT_VOLUME || declared.iter().any(|d| *d == volume.name) {
            base.push(volume.clone());
        } else {
            hotplug.push(volume.clone());
        }
    }
    (base, hotplug)
}

pub async fn handle(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
) -> Result<HandlerFlow, ControllerError> {
    let namespace = ctx.namespace();
    let name = ctx.name();

    let Some(hvm) = ctx.state.hvm().await? else {
        return Ok(HandlerFlow::proceed());
    };

    reconcile_hotplug_volumes(ctx, hv, &hvm).await?;
    reconcile_usb(ctx, hv, &hvm).await?;

    debug!("VirtualMachine {namespace}/{name}: device sets reconciled");
    Ok(HandlerFlow::proceed())
}

async fn reconcile_hotplug_volumes(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
    hvm: &crds::HypervisorVirtualMachine,
) -> Result<(), ControllerError> {
    let declared: Vec<String> = ctx
        .vm
        .current
        .spec
        .block_device_refs
        .iter()
        .map(|r| format!("{}-{}", r.kind.volume_prefix(), r.name))
        .collect();

    let attachments = ctx.state.attachments().await?;
    let mut desired = Vec::new();
    for attachment in &attachments {
        if attachment.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let phase = attachment
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default();
        if matches!(phase, AttachmentPhase::Failed | AttachmentPhase::Terminating) {
            continue;
        }
        if let Some(volume) = hotplug_volume(ctx, attachment).await? {
            // A device both declared and hotplug-requested stays with
            // its declared volume.
            if !declared.iter().any(|d| *d == volume.name) {
                desired.push(volume);
            }
        }
    }

    let volumes = hvm.spec.template.spec.volumes.clone();
    let (base, current_hotplug) = split_hotplug_volumes(&volumes, &declared);
    if current_hotplug == desired {
        return Ok(());
    }

    let mut next = base;
    next.extend(desired.iter().cloned());

    // Disk entries track the volume list: drop entries for removed
    // volumes, append entries for added ones.
    let mut disks: Vec<HvmDisk> = hvm
        .spec
        .template
        .spec
        .domain
        .devices
        .disks
        .iter()
        .filter(|d| next.iter().any(|v| v.name == d.name))
        .cloned()
        .collect();
    for volume in &desired {
        if !disks.iter().any(|d| d.name == volume.name) {
            disks.push(HvmDisk {
                name: volume.name.clone(),
                serial: volume.name.clone(),
                boot_order: None,
            });
        }
    }

    let added: Vec<_> = desired
        .iter()
        .filter(|v| !current_hotplug.iter().any(|c| c.name == v.name))
        .map(|v| v.name.clone())
        .collect();
    let removed: Vec<_> = current_hotplug
        .iter()
        .filter(|c| !desired.iter().any(|v| v.name == c.name))
        .map(|c| c.name.clone())
        .collect();
    info!(
        "VirtualMachine {}/{}: hotplug volume update (add: [{}], remove: [{}])",
        ctx.namespace(),
        ctx.name(),
        added.join(", "),
        removed.join(", ")
    );
    hv.update_volumes(&ctx.namespace(), &hvm.name_any(), &next, &disks)
        .await?;
    Ok(())
}

/// Builds the hotplug volume for one accepted attachment request, or
/// None while its device is not ready to attach.
async fn hotplug_volume(
    ctx: &mut VmContext,
    attachment: &VirtualMachineBlockDeviceAttachment,
) -> Result<Option<HvmVolume>, ControllerError> {
    let device_ref = &attachment.spec.block_device_ref;
    let volume_name = format!("{}-{}", device_ref.kind.volume_prefix(), device_ref.name);
    let resolved = ctx
        .state
        .resolve_device(&crds::BlockDeviceRef {
            kind: device_ref.kind,
            name: device_ref.name.clone(),
        })
        .await?;

    Ok(match resolved {
        Some(ResolvedDevice::Disk(disk)) => {
            let status = disk.status.unwrap_or_default();
            let ready = !status.target_pvc_name.is_empty()
                && status.conditions.is_true(device_condition::TYPE_READY);
            ready.then(|| HvmVolume {
                name: volume_name,
                persistent_volume_claim: Some(HvmPvcVolumeSource {
                    claim_name: status.target_pvc_name,
                    hotpluggable: true,
                }),
                ..Default::default()
            })
        }
        Some(ResolvedDevice::Image(image)) => {
            let storage = image.spec.storage;
            let status = image.status.unwrap_or_default();
            match storage {
                ImageStorage::PersistentVolumeClaim if !status.target_pvc_name.is_empty() => {
                    Some(HvmVolume {
                        name: volume_name,
                        persistent_volume_claim: Some(HvmPvcVolumeSource {
                            claim_name: status.target_pvc_name,
                            hotpluggable: true,
                        }),
                        ..Default::default()
                    })
                }
                ImageStorage::ContainerRegistry => Some(HvmVolume {
                    name: volume_name,
                    container_disk: Some(crds::hypervisor::HvmContainerDiskSource {
                        image: format!("vi:{}/{}", ctx.namespace(), device_ref.name),
                    }),
                    ..Default::default()
                }),
                _ => None,
            }
        }
        Some(ResolvedDevice::ClusterImage(_)) => Some(HvmVolume {
            name: volume_name,
            container_disk: Some(crds::hypervisor::HvmContainerDiskSource {
                image: format!("cvi:{}", device_ref.name),
            }),
            ..Default::default()
        }),
        None => {
            debug!(
                "VirtualMachine {}: hotplug device \"{}\" not found",
                ctx.name(),
                device_ref.name
            );
            None
        }
    })
}

async fn reconcile_usb(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
    hvm: &crds::HypervisorVirtualMachine,
) -> Result<(), ControllerError> {
    let namespace = ctx.namespace();
    let name = ctx.name();
    let current = hvm.spec.template.spec.domain.devices.host_usb_devices.clone();

    // Passthrough is incompatible with live migration: suppress new
    // attaches and detach existing devices while any migration is
    // requested or running.
    let migration_outstanding = migration_outstanding(ctx).await?;

    let spec_refs = ctx.vm.current.spec.usb_devices.clone();
    let mut desired = Vec::new();
    let mut status_refs = Vec::new();
    for device_ref in &spec_refs {
        let device = ctx.state.usb_device(&device_ref.name).await?;
        let (entry, status_ref) = usb_entry(&namespace, &name, &device_ref.name, device.as_ref());
        status_refs.push(status_ref);
        if let Some(entry) = entry {
            desired.push(entry);
        }
    }

    match plan_usb(&desired, &current, migration_outstanding) {
        UsbAction::Keep => {}
        UsbAction::DetachAll => {
            info!("VirtualMachine {namespace}/{name}: detaching USB devices before migration");
            hv.update_usb_devices(&namespace, &hvm.name_any(), &[]).await?;
            release_usb_claims(ctx, &current).await?;
        }
        UsbAction::Replace(devices) => {
            info!(
                "VirtualMachine {namespace}/{name}: updating USB passthrough set ({} devices)",
                devices.len()
            );
            claim_usb_devices(ctx, &devices).await?;
            hv.update_usb_devices(&namespace, &hvm.name_any(), &devices)
                .await?;
            let released: Vec<_> = current
                .iter()
                .filter(|c| !devices.iter().any(|d| d.name == c.name))
                .cloned()
                .collect();
            release_usb_claims(ctx, &released).await?;
        }
    }

    // Attached/hotplugged flags reflect what the machine spec carries
    // after this pass.
    let instance_running = ctx.state.hvmi().await?.is_some();
    let attached_now: Vec<String> = if migration_outstanding {
        Vec::new()
    } else {
        desired.iter().map(|d| d.name.clone()).collect()
    };
    for status_ref in &mut status_refs {
        status_ref.attached = attached_now.iter().any(|n| *n == status_ref.name);
        status_ref.hotplugged = status_ref.attached && instance_running;
    }
    ctx.vm.status_mut().usb_devices = status_refs;
    Ok(())
}

/// True while any migration signal for this machine is outstanding.
async fn migration_outstanding(ctx: &mut VmContext) -> Result<bool, ControllerError> {
    if ctx
        .vm
        .status_mut()
        .conditions
        .is_true(vm_condition::TYPE_MIGRATING)
    {
        return Ok(true);
    }
    let pending_request = ctx.state.operations().await?.into_iter().any(|op| {
        op.spec.type_.is_migration()
            && !op
                .status
                .as_ref()
                .map(|s| s.phase)
                .unwrap_or_default()
                .is_terminal()
            && op.metadata.deletion_timestamp.is_none()
    });
    Ok(pending_request)
}

/// Resolves one declared USB device to a passthrough entry and its
/// status ref. Devices owned by another machine or not ready yield no
/// entry.
fn usb_entry(
    namespace: &str,
    vm_name: &str,
    device_name: &str,
    device: Option<&UsbDevice>,
) -> (Option<HvmHostUsbDevice>, UsbDeviceStatusRef) {
    let mut status_ref = UsbDeviceStatusRef {
        name: device_name.to_owned(),
        attached: false,
        ready: false,
        hotplugged: false,
        address: None,
    };
    let Some(status) = device.and_then(|d| d.status.as_ref()) else {
        return (None, status_ref);
    };

    let owned_elsewhere = status
        .attached_to
        .as_ref()
        .is_some_and(|a| a.name != vm_name || a.namespace != namespace);
    if owned_elsewhere {
        warn!(
            "UsbDevice \"{device_name}\" is already attached to another VirtualMachine"
        );
        return (None, status_ref);
    }

    status_ref.ready = status.phase == UsbDevicePhase::Ready;
    if !status_ref.ready {
        return (None, status_ref);
    }

    status_ref.address = Some(UsbAddress {
        bus: status.bus,
        device: status.device_number,
    });
    (
        Some(HvmHostUsbDevice {
            name: device_name.to_owned(),
            bus: status.bus,
            device: status.device_number,
        }),
        status_ref,
    )
}

/// Records this machine as the consumer of each device.
async fn claim_usb_devices(
    ctx: &mut VmContext,
    devices: &[HvmHostUsbDevice],
) -> Result<(), ControllerError> {
    let api: Api<UsbDevice> = Api::all(ctx.state.client());
    let claim = serde_json::json!({
        "status": { "attachedTo": { "name": ctx.name(), "namespace": ctx.namespace() } }
    });
    for device in devices {
        api.patch_status(&device.name, &PatchParams::default(), &Patch::Merge(&claim))
            .await?;
    }
    Ok(())
}

/// Clears the consumer record of each device this machine held.
async fn release_usb_claims(
    ctx: &mut VmContext,
    devices: &[HvmHostUsbDevice],
) -> Result<(), ControllerError> {
    let api: Api<UsbDevice> = Api::all(ctx.state.client());
    let release = serde_json::json!({ "status": { "attachedTo": null } });
    for device in devices {
        match api
            .patch_status(&device.name, &PatchParams::default(), &Patch::Merge(&release))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "device_attachment_test.rs"]
mod device_attachment_test;
