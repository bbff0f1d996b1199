//! Deletion path and self-protection.
//!
//! First handler in the chain. On a live machine it only installs the
//! cleanup finalizer. On a deleting machine it tears the hypervisor
//! machine down, releases the device protection finalizers once
//! nothing is left running, and finally releases its own finalizer;
//! the chain stops in either deleting case.

use kube::api::{Api, DeleteParams};
use kube::ResourceExt;
use tracing::info;

use crds::virtual_machine::MachinePhase;
use crds::{
    finalizer, ClusterVirtualImage, HypervisorVirtualMachine, VirtualDisk, VirtualImage,
    VirtualMachine,
};
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::state::ResolvedDevice;

use super::VmContext;

pub async fn handle(ctx: &mut VmContext) -> Result<HandlerFlow, ControllerError> {
    let namespace = ctx.namespace();
    let name = ctx.name();

    if !ctx.is_deleting() {
        let api: Api<VirtualMachine> = Api::namespaced(ctx.state.client(), &namespace);
        super::ensure_finalizer(&api, &ctx.vm.current, finalizer::VM_CLEANUP).await?;
        return Ok(HandlerFlow::proceed());
    }

    ctx.vm.status_mut().phase = MachinePhase::Terminating;

    // The machine goes first; its controller tears the instance down.
    if let Some(hvm) = ctx.state.hvm().await? {
        if hvm.metadata.deletion_timestamp.is_none() {
            info!("Deleting hypervisor machine for VirtualMachine {namespace}/{name}");
            let api: Api<HypervisorVirtualMachine> =
                Api::namespaced(ctx.state.client(), &namespace);
            match api.delete(&hvm.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        // The machine deletion event retriggers this pass; nothing
        // else may run against a deleting object.
        return Ok(HandlerFlow::Stop);
    }

    release_device_protection(ctx).await?;

    let api: Api<VirtualMachine> = Api::namespaced(ctx.state.client(), &namespace);
    super::remove_finalizer(&api, &ctx.vm.current, finalizer::VM_CLEANUP).await?;
    info!("VirtualMachine {namespace}/{name} cleanup finished");
    Ok(HandlerFlow::Stop)
}

/// Drops this machine's protection finalizers from referenced devices.
///
/// A disk still mounted by another machine keeps its finalizer: the
/// protection name is shared across machines, so the last consumer
/// releases it.
async fn release_device_protection(ctx: &mut VmContext) -> Result<(), ControllerError> {
    let vm_name = ctx.name();
    let spec_refs = ctx.vm.current.spec.block_device_refs.clone();
    for device_ref in &spec_refs {
        match ctx.state.resolve_device(device_ref).await? {
            Some(ResolvedDevice::Disk(disk)) => {
                let still_used = disk
                    .status
                    .as_ref()
                    .map(|s| {
                        s.attached_to_virtual_machines
                            .iter()
                            .any(|a| a.name != vm_name)
                    })
                    .unwrap_or(false);
                if still_used {
                    continue;
                }
                let api: Api<VirtualDisk> = Api::namespaced(ctx.state.client(), &ctx.namespace());
                super::remove_finalizer(&api, &disk, finalizer::VD_PROTECTION).await?;
            }
            Some(ResolvedDevice::Image(image)) => {
                let api: Api<VirtualImage> = Api::namespaced(ctx.state.client(), &ctx.namespace());
                super::remove_finalizer(&api, &image, finalizer::VI_PROTECTION).await?;
            }
            Some(ResolvedDevice::ClusterImage(image)) => {
                let api: Api<ClusterVirtualImage> = Api::all(ctx.state.client());
                super::remove_finalizer(&api, &image, finalizer::CVI_PROTECTION).await?;
            }
            None => {}
        }
    }
    Ok(())
}
