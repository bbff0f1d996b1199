//! Phase computation and terminal status fields.
//!
//! Runs last in the chain: folds the instance phase, deletion state
//! and the conditions written by earlier handlers into the coarse
//! machine phase, fills node and IP address, and advances the
//! observed generation once every condition caught up.

use kube::ResourceExt;
use tracing::debug;

use crds::hypervisor::HvmiPhase;
use crds::virtual_machine::{vm_condition, MachinePhase};
use crds::{ip_condition, Condition, ConditionStatus, IpAddressPhase, ProvisioningType};
use reconciler::{all_conditions_observed, HandlerFlow};

use crate::error::ControllerError;

use super::VmContext;

/// Everything the phase fold looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInputs {
    /// The VirtualMachine itself carries a deletion timestamp.
    pub deleting: bool,

    /// A hypervisor machine exists.
    pub machine_exists: bool,

    /// Live instance phase and its own deletion flag, when one exists.
    pub instance: Option<(HvmiPhase, bool)>,

    /// The Migrating condition is True.
    pub migrating: bool,

    /// BlockDevicesReady is True.
    pub dependencies_ready: bool,
}

/// Pure fold from observed inputs to the coarse phase.
pub fn compute_phase(inputs: &PhaseInputs) -> MachinePhase {
    if inputs.deleting {
        return MachinePhase::Terminating;
    }
    match inputs.instance {
        Some((_, true)) => MachinePhase::Stopping,
        Some((phase, false)) => {
            if inputs.migrating {
                return MachinePhase::Migrating;
            }
            match phase {
                HvmiPhase::Running => MachinePhase::Running,
                HvmiPhase::Pending | HvmiPhase::Scheduling | HvmiPhase::Scheduled => {
                    MachinePhase::Starting
                }
                // A finished guest keeps its instance until the pod is
                // reaped.
                HvmiPhase::Succeeded => MachinePhase::Stopping,
                HvmiPhase::Failed | HvmiPhase::Unknown => MachinePhase::Degraded,
            }
        }
        None => {
            if !inputs.machine_exists && !inputs.dependencies_ready {
                MachinePhase::Pending
            } else {
                MachinePhase::Stopped
            }
        }
    }
}

/// Address the status should carry, derived fresh every pass. The
/// instance-reported guest address wins while one exists, the bound
/// lease address covers a stopped machine, and with both gone the
/// field empties.
pub fn resolve_address(instance_address: Option<&str>, lease_address: Option<&str>) -> String {
    match (instance_address, lease_address) {
        (Some(a), _) if !a.is_empty() => a.to_owned(),
        (_, Some(a)) => a.to_owned(),
        _ => String::new(),
    }
}

pub async fn handle(ctx: &mut VmContext) -> Result<HandlerFlow, ControllerError> {
    let generation = ctx.generation();

    let lease_address = sync_ip_address(ctx, generation).await?;
    sync_provisioning(ctx, generation);

    let hvm = ctx.state.hvm().await?;
    let hvmi = ctx.state.hvmi().await?;

    // Node comes straight off the instance.
    let instance_address = match hvmi.as_ref().and_then(|i| i.status.as_ref()) {
        Some(status) => {
            ctx.vm.status_mut().node = status.node_name.clone();
            status.interfaces.first().map(|i| i.ip_address.clone())
        }
        None => {
            ctx.vm.status_mut().node = String::new();
            None
        }
    };
    ctx.vm.status_mut().ip_address =
        resolve_address(instance_address.as_deref(), lease_address.as_deref());

    let inputs = PhaseInputs {
        deleting: ctx.is_deleting(),
        machine_exists: hvm.is_some(),
        instance: hvmi
            .as_ref()
            .map(|i| {
                (
                    i.status.as_ref().map(|s| s.phase).unwrap_or_default(),
                    i.metadata.deletion_timestamp.is_some(),
                )
            }),
        migrating: ctx
            .vm
            .status_mut()
            .conditions
            .is_true(vm_condition::TYPE_MIGRATING),
        dependencies_ready: ctx
            .vm
            .status_mut()
            .conditions
            .is_true(vm_condition::TYPE_BLOCK_DEVICES_READY),
    };
    let phase = compute_phase(&inputs);
    ctx.vm.status_mut().phase = phase;

    // The observed generation follows the slowest condition.
    if all_conditions_observed(&ctx.vm.status_mut().conditions, generation) {
        ctx.vm.status_mut().observed_generation = generation;
    } else {
        debug!(
            "VirtualMachine {}/{}: conditions still behind generation {generation}",
            ctx.namespace(),
            ctx.name()
        );
    }

    Ok(HandlerFlow::proceed())
}

/// Publishes the IpAddressReady condition and hands back the bound
/// lease address, if any, for the address fold in `handle`.
async fn sync_ip_address(
    ctx: &mut VmContext,
    generation: i64,
) -> Result<Option<String>, ControllerError> {
    let spec_name = ctx.vm.current.spec.virtual_machine_ip_address.clone();
    let lease = ctx.state.ip_address(&spec_name).await?;

    let bound = lease.as_ref().and_then(|l| l.status.as_ref()).filter(|s| {
        matches!(s.phase, IpAddressPhase::Bound | IpAddressPhase::Attached)
            && s.conditions.is_true(ip_condition::TYPE_BOUND)
            && !s.address.is_empty()
    });

    match bound {
        Some(status) => {
            let address = status.address.clone();
            ctx.vm.status_mut().conditions.set(Condition {
                type_: vm_condition::TYPE_IP_ADDRESS_READY.to_owned(),
                status: ConditionStatus::True,
                reason: vm_condition::REASON_READY.to_owned(),
                message: String::new(),
                observed_generation: generation,
                last_transition_time: None,
            });
            Ok(Some(address))
        }
        None => {
            let message = match &lease {
                Some(lease) => format!(
                    "Waiting for VirtualMachineIpAddress \"{}\" to be bound.",
                    lease.name_any()
                ),
                None => "Waiting for an IP address lease to be created.".to_owned(),
            };
            ctx.vm.status_mut().conditions.set(Condition {
                type_: vm_condition::TYPE_IP_ADDRESS_READY.to_owned(),
                status: ConditionStatus::False,
                reason: vm_condition::REASON_NOT_READY.to_owned(),
                message,
                observed_generation: generation,
                last_transition_time: None,
            });
            Ok(None)
        }
    }
}

/// Structural check of the provisioning input. Content rendering is
/// owned by the hypervisor layer.
fn sync_provisioning(ctx: &mut VmContext, generation: i64) {
    let problem = match &ctx.vm.current.spec.provisioning {
        None => None,
        Some(p) => match p.type_ {
            ProvisioningType::UserData if p.user_data.is_empty() => {
                Some("Provisioning of type UserData carries no user data.".to_owned())
            }
            ProvisioningType::UserDataRef
                if p.user_data_ref.as_ref().map(|r| r.name.as_str()).unwrap_or_default().is_empty() =>
            {
                Some("Provisioning of type UserDataRef names no secret.".to_owned())
            }
            _ => None,
        },
    };

    let (status, reason, message) = match problem {
        None => (
            ConditionStatus::True,
            vm_condition::REASON_READY,
            String::new(),
        ),
        Some(message) => (ConditionStatus::False, vm_condition::REASON_NOT_READY, message),
    };
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_PROVISIONING_READY.to_owned(),
        status,
        reason: reason.to_owned(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    });
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_test;
