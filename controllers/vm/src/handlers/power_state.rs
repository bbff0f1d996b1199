//! Power-state enforcer.
//!
//! A pure decision function maps run policy, observed instance state
//! and the last shutdown reason to exactly one action; a thin I/O
//! layer applies it. The run strategy on the hypervisor machine is
//! patched only when it actually differs.

use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::info;

use crds::hypervisor::HvmiPhase;
use crds::virtual_machine::{vm_annotation, RunPolicy};
use crds::VirtualMachine;
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::events::reason;
use crate::hypervisor_client::{HypervisorClient, PowerRequest};
use crate::shutdown::{inspect_pods, ShutdownInfo};

use super::machine_builder::run_strategy_for;
use super::VmContext;

/// One power action against the hypervisor machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    None,
    Start,
    Stop,
    Restart,
}

/// Observed instance state, reduced to what the decision needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceView {
    pub exists: bool,
    pub deleting: bool,
    pub phase: Option<HvmiPhase>,
}

impl InstanceView {
    fn terminal(&self) -> bool {
        matches!(self.phase, Some(HvmiPhase::Succeeded) | Some(HvmiPhase::Failed))
    }

    fn failed(&self) -> bool {
        self.phase == Some(HvmiPhase::Failed)
    }
}

/// Explicit user signals consumed by this handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerSignals {
    pub start_requested: bool,
    pub restart_requested: bool,
}

/// The decision table. Pure; all cluster I/O happens in [`handle`].
pub fn decide_power_action(
    run_policy: RunPolicy,
    instance: InstanceView,
    shutdown: ShutdownInfo,
    signals: PowerSignals,
) -> PowerAction {
    match run_policy {
        RunPolicy::AlwaysOff => {
            if instance.exists && !instance.deleting {
                PowerAction::Stop
            } else {
                PowerAction::None
            }
        }
        RunPolicy::AlwaysOn => {
            if !instance.exists {
                PowerAction::Start
            } else if instance.terminal() {
                PowerAction::Restart
            } else if signals.restart_requested {
                PowerAction::Restart
            } else {
                PowerAction::None
            }
        }
        RunPolicy::AlwaysOnUnlessStoppedManually => {
            if !instance.exists {
                // A completed pod without a guest reset is an
                // intentional stop and stays stopped.
                if shutdown.pod_completed && !shutdown.guest_reset {
                    if signals.start_requested {
                        PowerAction::Start
                    } else {
                        PowerAction::None
                    }
                } else {
                    PowerAction::Start
                }
            } else if instance.failed() {
                PowerAction::Restart
            } else if instance.terminal() {
                if shutdown.guest_reset {
                    PowerAction::Restart
                } else {
                    PowerAction::None
                }
            } else if signals.restart_requested {
                PowerAction::Restart
            } else {
                PowerAction::None
            }
        }
        RunPolicy::Manual => {
            if !instance.exists {
                if signals.start_requested {
                    PowerAction::Start
                } else {
                    PowerAction::None
                }
            } else if instance.terminal() {
                if shutdown.guest_reset {
                    PowerAction::Restart
                } else {
                    PowerAction::None
                }
            } else if signals.restart_requested {
                PowerAction::Restart
            } else {
                PowerAction::None
            }
        }
    }
}

pub async fn handle(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
) -> Result<HandlerFlow, ControllerError> {
    let namespace = ctx.namespace();
    let name = ctx.name();

    let Some(hvm) = ctx.state.hvm().await? else {
        // Nothing to enforce before the machine exists.
        return Ok(HandlerFlow::proceed());
    };

    // Keep the run strategy aligned with the policy.
    let desired_strategy = run_strategy_for(ctx.vm.current.spec.run_policy);
    if hvm.spec.run_strategy != desired_strategy {
        info!(
            "Patching run strategy of {namespace}/{name}: {:?} -> {:?}",
            hvm.spec.run_strategy, desired_strategy
        );
        hv.patch_run_strategy(&namespace, &name, desired_strategy)
            .await?;
    }

    let hvmi = ctx.state.hvmi().await?;
    let instance = InstanceView {
        exists: hvmi.is_some(),
        deleting: hvmi
            .as_ref()
            .is_some_and(|i| i.metadata.deletion_timestamp.is_some()),
        phase: hvmi
            .as_ref()
            .and_then(|i| i.status.as_ref())
            .map(|s| s.phase),
    };

    let pods = ctx.state.pods().await?;
    let shutdown = inspect_pods(&pods);

    let annotations = &ctx.vm.current.metadata.annotations;
    let signals = PowerSignals {
        start_requested: annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(vm_annotation::START_REQUESTED)),
        restart_requested: annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(vm_annotation::RESTART_REQUESTED)),
    };

    let action = decide_power_action(ctx.vm.current.spec.run_policy, instance, shutdown, signals);
    match action {
        PowerAction::None => {}
        PowerAction::Start => {
            info!("Starting VirtualMachine {namespace}/{name}");
            hv.request_power(&namespace, &name, PowerRequest::Start).await?;
            ctx.events
                .normal(&ctx.vm.current, reason::STARTED, "Start requested".to_owned())
                .await;
        }
        PowerAction::Stop => {
            info!("Stopping VirtualMachine {namespace}/{name}");
            hv.delete_instance(&namespace, &name).await?;
            ctx.state.invalidate_hvmi();
            ctx.events
                .normal(&ctx.vm.current, reason::STOPPED, "Stop requested".to_owned())
                .await;
        }
        PowerAction::Restart => {
            info!("Restarting VirtualMachine {namespace}/{name}");
            hv.request_power(&namespace, &name, PowerRequest::Restart).await?;
            ctx.events
                .normal(&ctx.vm.current, reason::RESTARTED, "Restart requested".to_owned())
                .await;
        }
    }

    if signals.start_requested || signals.restart_requested {
        clear_power_annotations(ctx).await?;
    }

    Ok(HandlerFlow::proceed())
}

/// Consumes the one-shot start/restart annotations.
async fn clear_power_annotations(ctx: &VmContext) -> Result<(), ControllerError> {
    let api: Api<VirtualMachine> = Api::namespaced(ctx.state.client(), &ctx.namespace());
    let patch = json!({ "metadata": { "annotations": {
        vm_annotation::START_REQUESTED: null,
        vm_annotation::RESTART_REQUESTED: null,
    } } });
    api.patch(&ctx.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "power_state_test.rs"]
mod power_state_test;
