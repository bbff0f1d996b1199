//! Migration orchestrator, machine side.
//!
//! Mirrors the instance's live-migration state into the status,
//! maintains the Migratable and Migrating conditions, and runs the
//! volume (storage) migration sub-protocol. Live-migration requests
//! themselves are owned by the operation controller; this handler only
//! observes them.

use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{info, warn};

use crds::hypervisor::{
    hvmi_condition, HvmiMigrationState, HypervisorVirtualMachine, UpdateVolumesStrategy,
};
use crds::virtual_machine::vm_condition;
use crds::{
    BlockDeviceKind, Condition, ConditionStatus, MigrationResult, VirtualDisk, VmLocation,
    VmMigrationState,
};
use reconciler::HandlerFlow;

use crate::error::ControllerError;
use crate::hypervisor_client::HypervisorClient;

use super::migration_volumes::{
    apply_plan, debounce, diverged, plan_in_flight, plan_volume_migration, target_claim_ready,
    DebounceState, VolumePlan,
};
use super::VmContext;

/// Poll interval while a migration target claim is provisioning.
const TARGET_CLAIM_REQUEUE: Duration = Duration::from_secs(60);

/// Why the machine can or cannot be live-migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migratability {
    Migratable,

    /// Migratable, and a storage migration is required to move disks.
    DisksShouldBeMigrating,

    NonMigratable(String),
}

/// Pure migratability verdict from the three inputs feeding it.
pub fn assess_migratability(
    live_migratable: Option<(ConditionStatus, String)>,
    single_writer_hotplugs: &[String],
    volume_plan_pending: bool,
) -> Migratability {
    if !single_writer_hotplugs.is_empty() {
        return Migratability::NonMigratable(format!(
            "Hotplugged single-writer disks block live migration: {}.",
            single_writer_hotplugs.join(", ")
        ));
    }
    match live_migratable {
        Some((ConditionStatus::False, message)) => {
            let message = if message.is_empty() {
                "The instance reports it cannot be live-migrated.".to_owned()
            } else {
                message
            };
            return Migratability::NonMigratable(message);
        }
        Some(_) | None => {}
    }
    if volume_plan_pending {
        Migratability::DisksShouldBeMigrating
    } else {
        Migratability::Migratable
    }
}

/// Projects instance migration state into the status form.
pub fn mirror_migration_state(state: &HvmiMigrationState) -> VmMigrationState {
    let result = if state.failed {
        Some(MigrationResult::Failed)
    } else if state.completed {
        Some(MigrationResult::Succeeded)
    } else {
        None
    };
    VmMigrationState {
        start_timestamp: state.start_timestamp,
        end_timestamp: state.end_timestamp,
        source: VmLocation {
            node: state.source_node.clone(),
            pod: state.source_pod.clone(),
        },
        target: VmLocation {
            node: state.target_node.clone(),
            pod: state.target_pod.clone(),
        },
        result,
    }
}

pub async fn handle(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
    settle_window: Duration,
) -> Result<HandlerFlow, ControllerError> {
    let generation = ctx.generation();
    let name = ctx.name();
    let namespace = ctx.namespace();

    let hvm = ctx.state.hvm().await?;
    let hvmi = ctx.state.hvmi().await?;

    // Mirror the instance migration state verbatim; a vanished instance
    // keeps the last recorded outcome visible.
    if let Some(state) = hvmi.as_ref().and_then(|i| i.status.as_ref()).and_then(|s| s.migration_state.as_ref()) {
        ctx.vm.status_mut().migration_state = Some(mirror_migration_state(state));
    }

    let Some(hvm) = hvm else {
        set_migratable(ctx, generation, &Migratability::NonMigratable(
            "VirtualMachine is not running.".to_owned(),
        ));
        set_migrating_idle(ctx, generation).await?;
        return Ok(HandlerFlow::proceed());
    };

    // Declared disks, resolved; images never migrate storage.
    let disk_refs: Vec<String> = ctx
        .vm
        .current
        .spec
        .block_device_refs
        .iter()
        .filter(|r| r.kind == BlockDeviceKind::VirtualDisk)
        .map(|r| r.name.clone())
        .collect();
    let mut disks: Vec<(String, VirtualDisk)> = Vec::with_capacity(disk_refs.len());
    for disk_name in disk_refs {
        if let Some(disk) = ctx.state.disk(&disk_name).await? {
            disks.push((disk_name, disk));
        }
    }

    let volumes = hvm.spec.template.spec.volumes.clone();
    let plan = plan_volume_migration(&volumes, &disks);

    let single_writer = single_writer_hotplugs(ctx).await?;
    let live_migratable = hvmi
        .as_ref()
        .and_then(|i| i.status.as_ref())
        .and_then(|s| s.conditions.get(hvmi_condition::TYPE_LIVE_MIGRATABLE))
        .map(|c| (c.status, c.message.clone()));
    let verdict = assess_migratability(live_migratable, &single_writer, !plan.is_empty());
    set_migratable(ctx, generation, &verdict);

    let in_flight = hvmi
        .as_ref()
        .and_then(|i| i.status.as_ref())
        .and_then(|s| s.migration_state.as_ref())
        .is_some_and(|m| m.start_timestamp.is_some() && !m.completed && !m.failed);

    if in_flight {
        ctx.vm.status_mut().conditions.set(Condition {
            type_: vm_condition::TYPE_MIGRATING.to_owned(),
            status: ConditionStatus::True,
            reason: vm_condition::REASON_MIGRATING_IN_PROGRESS.to_owned(),
            message: "Live migration is in progress.".to_owned(),
            observed_generation: generation,
            last_transition_time: None,
        });

        // Divergence guard: the set of volumes actually moving must
        // match the set the disks demand, otherwise revert the whole
        // list to force a clean resync. The demanded set is computed
        // against the instance's live claims: after the commit the
        // machine spec already carries the targets and would make a
        // healthy migration look diverged.
        let instance_claims = instance_claims(ctx).await?;
        let moving = moving_volumes(&volumes, &instance_claims);
        let expected = plan_in_flight(&instance_claims, &disks);
        if diverged(&expected, &moving) {
            warn!(
                "VirtualMachine {namespace}/{name}: migrating volume set diverged, reverting volume list"
            );
            revert_volumes(ctx, hv, &hvm, &instance_claims).await?;
            ctx.vm.status_mut().volume_migration_requested_at = None;
        }
        return Ok(HandlerFlow::proceed());
    }

    set_migrating_idle(ctx, generation).await?;

    if plan.is_empty() {
        if ctx.vm.status_mut().volume_migration_requested_at.is_some() {
            ctx.vm.status_mut().volume_migration_requested_at = None;
        }
        return Ok(HandlerFlow::proceed());
    }

    // Debounce anchor lives in the status so it survives restarts and
    // batches several disk edits into one storage migration.
    match debounce(
        ctx.vm.current.status.as_ref().and_then(|s| s.volume_migration_requested_at),
        Utc::now(),
        settle_window,
    ) {
        DebounceState::Stamp => {
            ctx.vm.status_mut().volume_migration_requested_at = Some(Utc::now());
            Ok(HandlerFlow::requeue(settle_window))
        }
        DebounceState::Waiting(left) => Ok(HandlerFlow::requeue(left)),
        DebounceState::Ready => {
            if !plan_targets_ready(ctx, &plan, &disks).await? {
                return Ok(HandlerFlow::requeue(TARGET_CLAIM_REQUEUE));
            }
            commit_volume_migration(ctx, hv, &hvm, &volumes, &plan).await?;
            ctx.vm.status_mut().volume_migration_requested_at = None;
            Ok(HandlerFlow::proceed())
        }
    }
}

fn set_migratable(ctx: &mut VmContext, generation: i64, verdict: &Migratability) {
    let (status, reason, message) = match verdict {
        Migratability::Migratable => (
            ConditionStatus::True,
            vm_condition::REASON_MIGRATABLE,
            String::new(),
        ),
        Migratability::DisksShouldBeMigrating => (
            ConditionStatus::True,
            vm_condition::REASON_DISKS_SHOULD_BE_MIGRATING,
            "A storage migration is required to move disk volumes.".to_owned(),
        ),
        Migratability::NonMigratable(message) => (
            ConditionStatus::False,
            vm_condition::REASON_NON_MIGRATABLE,
            message.clone(),
        ),
    };
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_MIGRATABLE.to_owned(),
        status,
        reason: reason.to_owned(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    });
}

/// Sets the Migrating condition when no migration is running: False
/// with a pending reason while a request waits, False otherwise.
async fn set_migrating_idle(ctx: &mut VmContext, generation: i64) -> Result<(), ControllerError> {
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
    let (reason, message) = if pending_request {
        (
            vm_condition::REASON_MIGRATING_PENDING,
            "Migration request is waiting to be executed.".to_owned(),
        )
    } else {
        (vm_condition::REASON_READY_TO_MIGRATE, String::new())
    };
    ctx.vm.status_mut().conditions.set(Condition {
        type_: vm_condition::TYPE_MIGRATING.to_owned(),
        status: ConditionStatus::False,
        reason: reason.to_owned(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    });
    Ok(())
}

/// Hotplugged disks backed by a single-writer claim; these pin the
/// machine to its node.
async fn single_writer_hotplugs(ctx: &mut VmContext) -> Result<Vec<String>, ControllerError> {
    let hotplug_claims: Vec<String> = ctx
        .state
        .hvmi()
        .await?
        .and_then(|i| i.status)
        .map(|s| {
            s.volume_status
                .into_iter()
                .filter(|v| v.hotplug && !v.persistent_volume_claim_name.is_empty())
                .map(|v| v.persistent_volume_claim_name)
                .collect()
        })
        .unwrap_or_default();

    let mut names = Vec::new();
    for claim in hotplug_claims {
        let Some(pvc) = ctx.state.pvc(&claim).await? else {
            continue;
        };
        let modes = pvc
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.as_ref())
            .cloned()
            .unwrap_or_default();
        if modes.iter().any(|m| m == "ReadWriteOnce")
            && !modes.iter().any(|m| m == "ReadWriteMany")
        {
            names.push(claim);
        }
    }
    Ok(names)
}

/// Claims the live instance currently uses, by volume name.
async fn instance_claims(
    ctx: &mut VmContext,
) -> Result<Vec<(String, String)>, ControllerError> {
    Ok(ctx
        .state
        .hvmi()
        .await?
        .and_then(|i| i.status)
        .map(|s| {
            s.volume_status
                .into_iter()
                .filter(|v| !v.persistent_volume_claim_name.is_empty())
                .map(|v| (v.name, v.persistent_volume_claim_name))
                .collect()
        })
        .unwrap_or_default())
}

/// Volumes whose desired claim differs from the claim the instance is
/// still using; these are the ones a running migration is moving.
fn moving_volumes(volumes: &[crds::hypervisor::HvmVolume], instance_claims: &[(String, String)]) -> Vec<String> {
    volumes
        .iter()
        .filter_map(|volume| {
            let desired = volume.persistent_volume_claim.as_ref()?;
            let (_, live) = instance_claims.iter().find(|(n, _)| *n == volume.name)?;
            (desired.claim_name != *live).then(|| volume.name.clone())
        })
        .collect()
}

async fn plan_targets_ready(
    ctx: &mut VmContext,
    plan: &[VolumePlan],
    disks: &[(String, VirtualDisk)],
) -> Result<bool, ControllerError> {
    for entry in plan {
        let disk_phase = disks
            .iter()
            .find(|(name, _)| format!("vd-{name}") == entry.volume_name)
            .and_then(|(_, d)| d.status.as_ref())
            .map(|s| s.phase)
            .unwrap_or_default();
        let pvc = ctx.state.pvc(&entry.target_claim).await?;
        let pvc_phase = pvc
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.phase.clone());
        if !target_claim_ready(pvc_phase.as_deref(), disk_phase) {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn commit_volume_migration(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
    hvm: &HypervisorVirtualMachine,
    volumes: &[crds::hypervisor::HvmVolume],
    plan: &[VolumePlan],
) -> Result<(), ControllerError> {
    let namespace = ctx.namespace();
    let name = hvm.name_any();
    let moved: Vec<_> = plan.iter().map(|p| p.volume_name.clone()).collect();
    info!(
        "VirtualMachine {namespace}/{}: requesting storage migration for {}",
        ctx.name(),
        moved.join(", ")
    );

    let api: Api<HypervisorVirtualMachine> = Api::namespaced(ctx.state.client(), &namespace);
    let strategy_patch =
        serde_json::json!({ "spec": { "updateVolumesStrategy": UpdateVolumesStrategy::Migration } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&strategy_patch))
        .await?;

    let updated = apply_plan(volumes, plan);
    let disks = hvm.spec.template.spec.domain.devices.disks.clone();
    hv.update_volumes(&namespace, &name, &updated, &disks).await?;
    Ok(())
}

/// Reverts the machine's volume list to the claims the instance is
/// actually using.
async fn revert_volumes(
    ctx: &mut VmContext,
    hv: &impl HypervisorClient,
    hvm: &HypervisorVirtualMachine,
    instance_claims: &[(String, String)],
) -> Result<(), ControllerError> {
    let reverted: Vec<_> = hvm
        .spec
        .template
        .spec
        .volumes
        .iter()
        .map(|volume| {
            let mut volume = volume.clone();
            if let Some(pvc) = &mut volume.persistent_volume_claim {
                if let Some((_, live)) = instance_claims.iter().find(|(n, _)| *n == volume.name) {
                    pvc.claim_name = live.clone();
                }
            }
            volume
        })
        .collect();
    let disks = hvm.spec.template.spec.domain.devices.disks.clone();
    hv.update_volumes(&ctx.namespace(), &hvm.name_any(), &reverted, &disks)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "migrating_test.rs"]
mod migrating_test;
