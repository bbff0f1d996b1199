//! Underlying-machine synchronizer.
//!
//! Builds the desired hypervisor machine, diffs the current spec
//! against the last applied one and either applies the change, defers
//! it behind a restart approval, or does nothing. The last applied
//! spec travels in an annotation on the hypervisor machine.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crds::hypervisor::HypervisorVirtualMachine;
use crds::virtual_machine::{vm_annotation, vm_condition, RestartApprovalMode, VirtualMachineSpec};
use crds::{Condition, ConditionStatus, VirtualMachine, VmClassPhase};
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::events::reason as event_reason;
use crate::hypervisor_client::{HypervisorClient, PowerRequest};
use crate::vmchange::{compare_specs, ActionType, SpecChanges};

use super::machine_builder::build_machine_spec;
use super::VmContext;

/// Poll interval while the referenced class is not ready.
const CLASS_REQUEUE: Duration = Duration::from_secs(2);

/// What the synchronizer does with the computed diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Apply the desired spec to the machine.
    Update {
        /// Also delete the stuck launcher pod; works around stale
        /// placement evaluation in the lower layer.
        delete_stuck_pod: bool,
    },

    /// Apply and immediately restart the guest.
    UpdateAndRestart,

    /// Record the pending changes and wait for an approved restart.
    Defer,

    /// Spec and machine already agree.
    Nothing,
}

/// Pure decision table over the classified diff.
pub fn decide(
    changes: &SpecChanges,
    machine_running: bool,
    machine_stopped: bool,
    unschedulable: bool,
    approval: RestartApprovalMode,
) -> SyncDecision {
    // A stopped machine is always updated: dependent resources (a
    // restored disk's PVC, a re-bound IP) may have changed without any
    // spec diff.
    if machine_stopped {
        return SyncDecision::Update {
            delete_stuck_pod: false,
        };
    }

    let placement_changed = changes
        .changes()
        .iter()
        .any(|c| c.path == ".virtualMachineClassName");
    if unschedulable && placement_changed {
        return SyncDecision::Update {
            delete_stuck_pod: true,
        };
    }

    match changes.action() {
        ActionType::None => SyncDecision::Nothing,
        ActionType::ApplyImmediate => SyncDecision::Update {
            delete_stuck_pod: false,
        },
        ActionType::Restart if !machine_running => SyncDecision::Update {
            delete_stuck_pod: false,
        },
        ActionType::Restart => match approval {
            RestartApprovalMode::Automatic => SyncDecision::UpdateAndRestart,
            RestartApprovalMode::Manual => SyncDecision::Defer,
        },
    }
}

/// Reads the last applied spec from the machine annotation.
pub fn load_last_applied(
    hvm: &HypervisorVirtualMachine,
) -> Result<Option<VirtualMachineSpec>, ControllerError> {
    let Some(raw) = hvm.annotations().get(vm_annotation::LAST_APPLIED_SPEC) else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| ControllerError::MalformedLastApplied(hvm.name_any(), e))
}

pub async fn handle(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
) -> Result<HandlerFlow, ControllerError> {
    let generation = ctx.generation();
    let name = ctx.name();
    let namespace = ctx.namespace();

    // The class gates everything: without it no machine can be built.
    let class_name = ctx.vm.current.spec.virtual_machine_class_name.clone();
    let class = ctx.state.class(&class_name).await?;
    let class_ready = class
        .as_ref()
        .and_then(|c| c.status.as_ref())
        .is_some_and(|s| s.phase == VmClassPhase::Ready);
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_CLASS_READY.to_owned(),
        status: if class_ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: if class_ready {
            vm_condition::REASON_READY.to_owned()
        } else {
            vm_condition::REASON_NOT_READY.to_owned()
        },
        message: if class_ready {
            String::new()
        } else {
            format!("VirtualMachineClass \"{class_name}\" is not ready.")
        },
        observed_generation: generation,
        last_transition_time: None,
    });
    if !class_ready {
        return Ok(HandlerFlow::requeue(CLASS_REQUEUE));
    }

    // Resolve declared devices once for the builder.
    let spec_refs = ctx.vm.current.spec.block_device_refs.clone();
    let mut devices = Vec::with_capacity(spec_refs.len());
    for device_ref in spec_refs {
        let resolved = ctx.state.resolve_device(&device_ref).await?;
        devices.push((device_ref, resolved));
    }

    let hvm = ctx.state.hvm().await?;
    let api: Api<HypervisorVirtualMachine> = Api::namespaced(ctx.state.client(), &namespace);

    let Some(hvm) = hvm else {
        // Nothing exists yet; wait for devices, then create.
        if !ctx
            .vm
            .status_mut()
            .conditions
            .is_true(vm_condition::TYPE_BLOCK_DEVICES_READY)
        {
            set_configuration_applied(
                ctx,
                generation,
                false,
                "Waiting for block devices to be ready.".to_owned(),
            );
            return Ok(HandlerFlow::proceed());
        }

        let desired = build_machine_spec(&ctx.vm.current, class.as_ref(), &devices, None);
        let machine = HypervisorVirtualMachine {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![owner_reference(&ctx.vm.current)]),
                annotations: Some(
                    [(
                        vm_annotation::LAST_APPLIED_SPEC.to_owned(),
                        serde_json::to_string(&ctx.vm.current.spec)?,
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            spec: desired,
            status: None,
        };
        info!("Creating hypervisor machine for VirtualMachine {namespace}/{name}");
        api.create(&PostParams::default(), &machine).await?;
        set_configuration_applied(ctx, generation, true, String::new());
        clear_pending_restart(ctx, generation);
        return Ok(HandlerFlow::proceed());
    };

    let last_applied = load_last_applied(&hvm)?;
    let changes = match &last_applied {
        Some(prev) => compare_specs(prev, &ctx.vm.current.spec),
        // Missing annotation: force one update that writes it.
        None => {
            warn!("Hypervisor machine {namespace}/{name} has no last-applied annotation");
            compare_specs(&Default::default(), &ctx.vm.current.spec)
        }
    };

    let hvmi = ctx.state.hvmi().await?;
    let pods = ctx.state.pods().await?;
    let machine_running = hvmi
        .as_ref()
        .is_some_and(|i| i.metadata.deletion_timestamp.is_none());
    let machine_stopped = hvmi.is_none() && !pods.iter().any(pod_running);
    let unschedulable = pods.iter().any(pod_unschedulable);

    let approval = ctx
        .vm
        .current
        .spec
        .disruptions
        .as_ref()
        .map(|d| d.restart_approval_mode)
        .unwrap_or_default();

    match decide(&changes, machine_running, machine_stopped, unschedulable, approval) {
        SyncDecision::Nothing => {
            set_configuration_applied(ctx, generation, true, String::new());
            clear_pending_restart(ctx, generation);
        }
        SyncDecision::Update { delete_stuck_pod } => {
            apply_update(ctx, &api, &hvm, class.as_ref(), &devices).await?;
            if delete_stuck_pod {
                delete_unschedulable_pods(ctx, &pods).await?;
            }
            set_configuration_applied(ctx, generation, true, String::new());
            clear_pending_restart(ctx, generation);
        }
        SyncDecision::UpdateAndRestart => {
            apply_update(ctx, &api, &hvm, class.as_ref(), &devices).await?;
            info!("Restarting VirtualMachine {namespace}/{name} to apply approved changes");
            hv.request_power(&namespace, &name, PowerRequest::Restart)
                .await?;
            set_configuration_applied(ctx, generation, true, String::new());
            clear_pending_restart(ctx, generation);
        }
        SyncDecision::Defer => {
            let pending = changes.pending_changes();
            let paths: Vec<_> = pending.iter().map(|c| c.path.clone()).collect();
            debug!(
                "VirtualMachine {namespace}/{name}: deferring disruptive changes: {}",
                paths.join(", ")
            );
            let already_deferred = ctx
                .vm
                .current
                .status
                .as_ref()
                .is_some_and(|s| s.conditions.is_true(vm_condition::TYPE_AWAITING_RESTART));
            if !already_deferred {
                ctx.events
                    .warning(
                        &ctx.vm.current,
                        event_reason::AWAITING_RESTART,
                        format!(
                            "Waiting for a restart to apply changes: {}.",
                            paths.join(", ")
                        ),
                    )
                    .await;
            }
            ctx.vm.status_mut().restart_awaiting_changes = pending;
            ctx.vm.status_mut().conditions.set(Condition {
                type_: vm_condition::TYPE_AWAITING_RESTART.to_owned(),
                status: ConditionStatus::True,
                reason: vm_condition::REASON_RESTART_AWAITING_CHANGES.to_owned(),
                message: format!(
                    "Waiting for a restart to apply changes: {}.",
                    paths.join(", ")
                ),
                observed_generation: generation,
                last_transition_time: None,
            });
            set_configuration_applied(
                ctx,
                generation,
                false,
                "Disruptive changes are waiting for an approved restart.".to_owned(),
            );
        }
    }

    Ok(HandlerFlow::proceed())
}

async fn apply_update(
    ctx: &mut VmContext,
    api: &Api<HypervisorVirtualMachine>,
    hvm: &HypervisorVirtualMachine,
    class: Option<&crds::VirtualMachineClass>,
    devices: &[(crds::BlockDeviceRef, Option<crate::state::ResolvedDevice>)],
) -> Result<(), ControllerError> {
    let desired = build_machine_spec(&ctx.vm.current, class, devices, Some(hvm));
    let patch = serde_json::json!({
        "metadata": { "annotations": {
            vm_annotation::LAST_APPLIED_SPEC: serde_json::to_string(&ctx.vm.current.spec)?
        } },
        "spec": desired,
    });
    info!(
        "Updating hypervisor machine {}/{}",
        ctx.namespace(),
        ctx.name()
    );
    api.patch(&hvm.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn set_configuration_applied(ctx: &mut VmContext, generation: i64, applied: bool, message: String) {
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_CONFIGURATION_APPLIED.to_owned(),
        status: if applied {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: if applied {
            vm_condition::REASON_CONFIGURATION_APPLIED.to_owned()
        } else {
            vm_condition::REASON_CONFIGURATION_NOT_APPLIED.to_owned()
        },
        message,
        observed_generation: generation,
        last_transition_time: None,
    });
}

fn clear_pending_restart(ctx: &mut VmContext, generation: i64) {
    ctx.vm.status_mut().restart_awaiting_changes = Vec::new();
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_AWAITING_RESTART.to_owned(),
        status: ConditionStatus::False,
        reason: vm_condition::REASON_RESTART_NOT_NEEDED.to_owned(),
        message: String::new(),
        observed_generation: generation,
        last_transition_time: None,
    });
}

fn owner_reference(vm: &VirtualMachine) -> OwnerReference {
    OwnerReference {
        api_version: VirtualMachine::api_version(&()).into_owned(),
        kind: VirtualMachine::kind(&()).into_owned(),
        name: vm.name_any(),
        uid: vm.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn pod_running(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Running") | Some("Pending")
    )
}

fn pod_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
}

async fn delete_unschedulable_pods(ctx: &VmContext, pods: &[Pod]) -> Result<(), ControllerError> {
    let api: Api<Pod> = Api::namespaced(ctx.state.client(), &ctx.namespace());
    for pod in pods.iter().filter(|p| pod_unschedulable(p)) {
        warn!(
            "Deleting unschedulable launcher pod {} after placement change",
            pod.name_any()
        );
        match api.delete(&pod.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "sync_hypervisor_test.rs"]
mod sync_hypervisor_test;
