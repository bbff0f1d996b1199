//! Block Device Coordinator.
//!
//! Recomputes `status.blockDeviceRefs` from scratch every pass,
//! protects referenced devices with finalizers, detects conflicts and
//! publishes the `BlockDevicesReady` condition with the aggregate
//! readiness message.

use std::time::Duration;

use kube::api::Api;
use kube::ResourceExt;
use tracing::{debug, warn};

use crds::block_device::device_condition;
use crds::virtual_machine::{
    vm_condition, BlockDeviceKind, BlockDeviceStatusRef, BLOCK_DEVICE_ATTACHED_LIMIT,
};
use crds::{
    AttachmentPhase, ClusterVirtualImage, Condition, ConditionStatus, DiskPhase, ImagePhase,
    VirtualDisk, VirtualImage, VirtualMachine, VirtualMachineBlockDeviceAttachment,
};
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::events::reason as event_reason;
use crate::state::ResolvedDevice;

use super::VmContext;

/// Poll interval while devices are still provisioning or missing.
const PROVISIONING_REQUEUE: Duration = Duration::from_secs(60);

/// Counts devices against the attach limit.
///
/// Narrow seam so the limit policy can be swapped or mocked without
/// touching the coordinator.
pub trait BlockDeviceCounter {
    fn count_to_attach(
        &self,
        vm: &VirtualMachine,
        attachments: &[VirtualMachineBlockDeviceAttachment],
    ) -> usize;
}

/// Default counter: declared refs plus non-terminal hotplug requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecAttachmentCounter;

impl BlockDeviceCounter for SpecAttachmentCounter {
    fn count_to_attach(
        &self,
        vm: &VirtualMachine,
        attachments: &[VirtualMachineBlockDeviceAttachment],
    ) -> usize {
        let hotplugged = attachments
            .iter()
            .filter(|a| {
                !matches!(
                    a.status.as_ref().map(|s| s.phase).unwrap_or_default(),
                    AttachmentPhase::Failed | AttachmentPhase::Terminating
                )
            })
            .count();
        vm.spec.block_device_refs.len() + hotplugged
    }
}

/// Readiness view of one declared device, input to the pure summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReadiness {
    pub kind: BlockDeviceKind,
    pub name: String,
    pub ready: bool,
    pub provisioning: bool,
    pub in_use_for_image_creation: bool,
    pub attached_to_other_vm: bool,
}

/// Aggregate readiness over the declared devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSummary {
    pub ready: usize,
    pub total: usize,
    pub message: String,
    pub any_provisioning: bool,
}

impl ReadinessSummary {
    pub fn all_ready(&self) -> bool {
        self.ready == self.total
    }
}

fn kind_display(kind: BlockDeviceKind) -> &'static str {
    match kind {
        BlockDeviceKind::VirtualDisk => "Virtual disk",
        BlockDeviceKind::VirtualImage => "Virtual image",
        BlockDeviceKind::ClusterVirtualImage => "Cluster virtual image",
    }
}

/// Builds the human-readable readiness aggregate.
///
/// Singular when exactly one device is declared; otherwise "R/M" with
/// categorized suffixes for devices blocked by image-creation use or
/// another machine.
pub fn summarize(devices: &[DeviceReadiness]) -> ReadinessSummary {
    let total = devices.len();
    let ready = devices.iter().filter(|d| d.ready).count();
    let any_provisioning = devices.iter().any(|d| !d.ready && d.provisioning);

    if ready == total {
        return ReadinessSummary {
            ready,
            total,
            message: String::new(),
            any_provisioning: false,
        };
    }

    if total == 1 {
        return ReadinessSummary {
            ready,
            total,
            message: format!("Waiting for block device \"{}\" to be ready.", devices[0].name),
            any_provisioning,
        };
    }

    let mut blockers = Vec::new();
    for device in devices.iter().filter(|d| !d.ready) {
        if device.in_use_for_image_creation {
            blockers.push(format!(
                "{} \"{}\" is in use for image creation.",
                kind_display(device.kind),
                device.name
            ));
        } else if device.attached_to_other_vm {
            blockers.push(format!(
                "{} \"{}\" is attached to another VirtualMachine.",
                kind_display(device.kind),
                device.name
            ));
        }
    }

    let message = if blockers.is_empty() {
        format!("Waiting for block devices to be ready: {ready}/{total}.")
    } else {
        format!(
            "Waiting for block devices to be ready to use: {ready}/{total}; {}",
            blockers.join(" ")
        )
    };

    ReadinessSummary {
        ready,
        total,
        message,
        any_provisioning,
    }
}

fn disk_readiness(vm_name: &str, name: &str, disk: Option<&VirtualDisk>) -> DeviceReadiness {
    let Some(disk) = disk else {
        return absent(BlockDeviceKind::VirtualDisk, name);
    };
    let status = disk.status.clone().unwrap_or_default();
    let in_use_for_image_creation = status
        .conditions
        .get(device_condition::TYPE_IN_USE)
        .is_some_and(|c| {
            c.status == ConditionStatus::True
                && c.reason == device_condition::REASON_USED_FOR_IMAGE_CREATION
        });
    let attached_to_other_vm = status
        .attached_to_virtual_machines
        .iter()
        .any(|a| a.name != vm_name && a.mounted);
    let bound = !status.target_pvc_name.is_empty();
    let ready_condition = status.conditions.is_true(device_condition::TYPE_READY);

    DeviceReadiness {
        kind: BlockDeviceKind::VirtualDisk,
        name: name.to_owned(),
        ready: bound && ready_condition && !in_use_for_image_creation && !attached_to_other_vm,
        provisioning: matches!(
            status.phase,
            DiskPhase::Pending | DiskPhase::Provisioning | DiskPhase::WaitForFirstConsumer
        ),
        in_use_for_image_creation,
        attached_to_other_vm,
    }
}

fn image_readiness(kind: BlockDeviceKind, name: &str, phase: Option<ImagePhase>) -> DeviceReadiness {
    let Some(phase) = phase else {
        return absent(kind, name);
    };
    DeviceReadiness {
        kind,
        name: name.to_owned(),
        ready: phase == ImagePhase::Ready,
        provisioning: matches!(
            phase,
            ImagePhase::Pending | ImagePhase::Provisioning | ImagePhase::WaitForUserUpload
        ),
        in_use_for_image_creation: false,
        attached_to_other_vm: false,
    }
}

fn absent(kind: BlockDeviceKind, name: &str) -> DeviceReadiness {
    DeviceReadiness {
        kind,
        name: name.to_owned(),
        ready: false,
        provisioning: false,
        in_use_for_image_creation: false,
        attached_to_other_vm: false,
    }
}

/// Runs the coordinator for one pass.
pub async fn handle(
    ctx: &mut VmContext,
    counter: &impl BlockDeviceCounter,
) -> Result<HandlerFlow, ControllerError> {
    let vm_name = ctx.name();
    let generation = ctx.generation();
    let spec_refs = ctx.vm.current.spec.block_device_refs.clone();
    let attachments = ctx.state.attachments().await?;

    // Attach limit is checked first and fails closed.
    let to_attach = counter.count_to_attach(&ctx.vm.current, &attachments);
    if to_attach > BLOCK_DEVICE_ATTACHED_LIMIT {
        ctx.vm.status_mut().conditions.set(Condition {
            type_: vm_condition::TYPE_BLOCK_DEVICES_READY.to_owned(),
            status: ConditionStatus::False,
            reason: vm_condition::REASON_BLOCK_DEVICE_LIMIT_EXCEEDED.to_owned(),
            message: format!(
                "Cannot attach {to_attach} block devices (limit {BLOCK_DEVICE_ATTACHED_LIMIT}) to VirtualMachine \"{vm_name}\"."
            ),
            observed_generation: generation,
            last_transition_time: None,
        });
        return Ok(HandlerFlow::proceed());
    }

    // Resolve declared devices, protect them and collect readiness.
    let mut readiness = Vec::with_capacity(spec_refs.len());
    for device_ref in &spec_refs {
        let resolved = ctx.state.resolve_device(device_ref).await?;
        match &resolved {
            Some(device) => protect_device(ctx, device).await?,
            None => debug!(
                "VirtualMachine {vm_name}: {:?} \"{}\" not found",
                device_ref.kind, device_ref.name
            ),
        }
        readiness.push(match (device_ref.kind, resolved) {
            (BlockDeviceKind::VirtualDisk, Some(ResolvedDevice::Disk(d))) => {
                disk_readiness(&vm_name, &device_ref.name, Some(&d))
            }
            (BlockDeviceKind::VirtualDisk, _) => {
                disk_readiness(&vm_name, &device_ref.name, None)
            }
            (BlockDeviceKind::VirtualImage, Some(ResolvedDevice::Image(i))) => image_readiness(
                device_ref.kind,
                &device_ref.name,
                Some(i.status.unwrap_or_default().phase),
            ),
            (BlockDeviceKind::ClusterVirtualImage, Some(ResolvedDevice::ClusterImage(i))) => {
                image_readiness(
                    device_ref.kind,
                    &device_ref.name,
                    Some(i.status.unwrap_or_default().phase),
                )
            }
            (kind, _) => absent(kind, &device_ref.name),
        });
    }

    // Full status-ref recomputation: declared refs first, hotplugged
    // refs after, cross-referenced against the hypervisor machine and
    // the live instance.
    let status_refs = compute_status_refs(ctx, &spec_refs, &attachments).await?;

    // Devices the previous pass recorded but this one no longer
    // references lose their protection finalizer; without this a disk
    // removed from a live machine could never be deleted.
    let previous_refs = ctx
        .vm
        .current
        .status
        .as_ref()
        .map(|s| s.block_device_refs.clone())
        .unwrap_or_default();
    let stale = stale_refs(&previous_refs, &status_refs);
    ctx.vm.status_mut().block_device_refs = status_refs;
    release_stale_protection(ctx, &stale).await?;

    let summary = summarize(&readiness);
    let condition = if summary.all_ready() {
        Condition {
            type_: vm_condition::TYPE_BLOCK_DEVICES_READY.to_owned(),
            status: ConditionStatus::True,
            reason: vm_condition::REASON_BLOCK_DEVICES_READY.to_owned(),
            message: String::new(),
            observed_generation: generation,
            last_transition_time: None,
        }
    } else {
        let reason = if summary.any_provisioning {
            vm_condition::REASON_WAITING_FOR_PROVISIONING
        } else {
            vm_condition::REASON_BLOCK_DEVICES_NOT_READY
        };
        Condition {
            type_: vm_condition::TYPE_BLOCK_DEVICES_READY.to_owned(),
            status: ConditionStatus::False,
            reason: reason.to_owned(),
            message: summary.message.clone(),
            observed_generation: generation,
            last_transition_time: None,
        }
    };
    ctx.vm.status_mut().conditions.set(condition);

    for device in readiness.iter().filter(|d| d.attached_to_other_vm) {
        ctx.events
            .warning(
                &ctx.vm.current,
                event_reason::BLOCK_DEVICE_CONFLICT,
                format!(
                    "{} \"{}\" is attached to another VirtualMachine.",
                    kind_display(device.kind),
                    device.name
                ),
            )
            .await;
    }

    if summary.all_ready() {
        Ok(HandlerFlow::proceed())
    } else {
        // Device controllers are not watched; poll until ready.
        Ok(HandlerFlow::requeue(PROVISIONING_REQUEUE))
    }
}

async fn protect_device(ctx: &mut VmContext, device: &ResolvedDevice) -> Result<(), ControllerError> {
    match device {
        ResolvedDevice::Disk(disk) => {
            if disk.metadata.deletion_timestamp.is_some() {
                warn!(
                    "VirtualMachine {}: referenced disk \"{}\" is being deleted",
                    ctx.name(),
                    disk.name_any()
                );
                return Ok(());
            }
            let api: Api<VirtualDisk> = Api::namespaced(ctx.state.client(), &ctx.namespace());
            super::ensure_finalizer(&api, disk, crds::finalizer::VD_PROTECTION).await?;
        }
        ResolvedDevice::Image(image) => {
            if image.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            let api: Api<VirtualImage> = Api::namespaced(ctx.state.client(), &ctx.namespace());
            super::ensure_finalizer(&api, image, crds::finalizer::VI_PROTECTION).await?;
        }
        ResolvedDevice::ClusterImage(image) => {
            if image.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            let api: Api<ClusterVirtualImage> = Api::all(ctx.state.client());
            super::ensure_finalizer(&api, image, crds::finalizer::CVI_PROTECTION).await?;
        }
    }
    Ok(())
}

/// Refs present in the previous status but absent from the current
/// one, by kind and name.
pub fn stale_refs(
    previous: &[BlockDeviceStatusRef],
    current: &[BlockDeviceStatusRef],
) -> Vec<(BlockDeviceKind, String)> {
    previous
        .iter()
        .filter(|p| {
            !current
                .iter()
                .any(|c| c.name == p.name && c.kind == p.kind)
        })
        .filter_map(|p| p.kind.map(|kind| (kind, p.name.clone())))
        .collect()
}

/// Drops the protection finalizer from devices this machine stopped
/// referencing. A disk still mounted by another machine keeps it.
async fn release_stale_protection(
    ctx: &mut VmContext,
    stale: &[(BlockDeviceKind, String)],
) -> Result<(), ControllerError> {
    let vm_name = ctx.name();
    for (kind, name) in stale {
        let device_ref = crds::BlockDeviceRef {
            kind: *kind,
            name: name.clone(),
        };
        match ctx.state.resolve_device(&device_ref).await? {
            Some(ResolvedDevice::Disk(disk)) => {
                let still_used = disk
                    .status
                    .as_ref()
                    .is_some_and(|s| {
                        s.attached_to_virtual_machines
                            .iter()
                            .any(|a| a.name != vm_name)
                    });
                if still_used {
                    continue;
                }
                let api: Api<VirtualDisk> = Api::namespaced(ctx.state.client(), &ctx.namespace());
                super::remove_finalizer(&api, &disk, crds::finalizer::VD_PROTECTION).await?;
            }
            Some(ResolvedDevice::Image(image)) => {
                let api: Api<VirtualImage> = Api::namespaced(ctx.state.client(), &ctx.namespace());
                super::remove_finalizer(&api, &image, crds::finalizer::VI_PROTECTION).await?;
            }
            Some(ResolvedDevice::ClusterImage(image)) => {
                let api: Api<ClusterVirtualImage> = Api::all(ctx.state.client());
                super::remove_finalizer(&api, &image, crds::finalizer::CVI_PROTECTION).await?;
            }
            None => {}
        }
    }
    Ok(())
}

async fn compute_status_refs(
    ctx: &mut VmContext,
    spec_refs: &[crds::BlockDeviceRef],
    attachments: &[VirtualMachineBlockDeviceAttachment],
) -> Result<Vec<BlockDeviceStatusRef>, ControllerError> {
    let hvm = ctx.state.hvm().await?;
    let hvmi = ctx.state.hvmi().await?;
    let volume_status = hvmi
        .as_ref()
        .and_then(|i| i.status.as_ref())
        .map(|s| s.volume_status.clone())
        .unwrap_or_default();
    let hvm_volumes = hvm
        .as_ref()
        .map(|m| m.spec.template.spec.volumes.clone())
        .unwrap_or_default();

    let mut refs = Vec::new();
    for device_ref in spec_refs {
        refs.push(status_ref_for(
            device_ref.kind,
            &device_ref.name,
            None,
            &volume_status,
            &hvm_volumes,
            attachments,
            ctx,
        )
        .await?);
    }

    // Accepted hotplug refs follow the declared ones.
    for attachment in attachments {
        let accepted = attachment
            .status
            .as_ref()
            .is_some_and(|s| s.virtual_machine_name == ctx.name());
        if !accepted {
            continue;
        }
        let device_ref = &attachment.spec.block_device_ref;
        if spec_refs
            .iter()
            .any(|r| r.kind == device_ref.kind && r.name == device_ref.name)
        {
            continue;
        }
        refs.push(
            status_ref_for(
                device_ref.kind,
                &device_ref.name,
                Some(attachment.name_any()),
                &volume_status,
                &hvm_volumes,
                attachments,
                ctx,
            )
            .await?,
        );
    }

    Ok(refs)
}

#[allow(clippy::too_many_arguments)]
async fn status_ref_for(
    kind: BlockDeviceKind,
    name: &str,
    attachment_name: Option<String>,
    volume_status: &[crds::HvmiVolumeStatus],
    hvm_volumes: &[crds::HvmVolume],
    attachments: &[VirtualMachineBlockDeviceAttachment],
    ctx: &mut VmContext,
) -> Result<BlockDeviceStatusRef, ControllerError> {
    let volume_name = format!("{}-{}", kind.volume_prefix(), name);

    let vs = volume_status.iter().find(|v| v.name == volume_name);
    let hvm_volume = hvm_volumes.iter().find(|v| v.name == volume_name);

    // Hotplug classification, three fallback signals in priority
    // order: explicit hotplug status, hotpluggable PVC reference,
    // matching live attachment request for container-backed volumes.
    let hotplugged = match (vs, hvm_volume) {
        (Some(v), _) if v.hotplug => true,
        (_, Some(vol)) if vol.persistent_volume_claim.as_ref().is_some_and(|p| p.hotpluggable) => {
            true
        }
        (_, Some(vol)) if vol.container_disk.is_some() => attachments.iter().any(|a| {
            a.spec.block_device_ref.kind == kind
                && a.spec.block_device_ref.name == name
                && a.status.as_ref().is_some_and(|s| {
                    matches!(s.phase, AttachmentPhase::InProgress | AttachmentPhase::Attached)
                })
        }),
        _ => false,
    };

    let size = match kind {
        BlockDeviceKind::VirtualDisk => ctx
            .state
            .disk(name)
            .await?
            .and_then(|d| d.status)
            .map(|s| s.capacity)
            .unwrap_or_default(),
        BlockDeviceKind::VirtualImage => ctx
            .state
            .image(name)
            .await?
            .and_then(|i| i.status)
            .map(|s| s.size)
            .unwrap_or_default(),
        BlockDeviceKind::ClusterVirtualImage => ctx
            .state
            .cluster_image(name)
            .await?
            .and_then(|i| i.status)
            .map(|s| s.size)
            .unwrap_or_default(),
    };

    Ok(BlockDeviceStatusRef {
        kind: Some(kind),
        name: name.to_owned(),
        target: vs.map(|v| v.target.clone()).unwrap_or_default(),
        attached: vs.is_some_and(|v| v.phase == crds::VolumePhase::Ready),
        hotplugged,
        size,
        virtual_machine_block_device_attachment_name: attachment_name.unwrap_or_default(),
    })
}

#[cfg(test)]
#[path = "block_device_test.rs"]
mod block_device_test;
