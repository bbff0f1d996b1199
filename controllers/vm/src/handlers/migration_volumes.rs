//! Volume (storage) migration sub-protocol.
//!
//! A disk whose backing claim changed (restored disk, storage-class
//! move) must have its volume migrated on the running machine. Edits
//! are debounced through a timestamp persisted in the status so that
//! several disk changes batch into one storage migration, and the
//! debounce anchor survives controller restarts.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crds::hypervisor::HvmVolume;
use crds::{DiskPhase, VirtualDisk};

/// One volume whose backing claim has to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumePlan {
    pub volume_name: String,
    pub current_claim: String,
    pub target_claim: String,
}

/// Computes the set of volumes whose claim on the machine differs from
/// the claim the disk currently points at.
pub fn plan_volume_migration(
    hvm_volumes: &[HvmVolume],
    disks: &[(String, VirtualDisk)],
) -> Vec<VolumePlan> {
    let mut plans = Vec::new();
    for (name, disk) in disks {
        let volume_name = format!("vd-{name}");
        let Some(volume) = hvm_volumes.iter().find(|v| v.name == volume_name) else {
            continue;
        };
        let Some(pvc) = &volume.persistent_volume_claim else {
            continue;
        };
        let target = disk
            .status
            .as_ref()
            .map(|s| s.target_pvc_name.clone())
            .unwrap_or_default();
        if target.is_empty() || target == pvc.claim_name {
            continue;
        }
        plans.push(VolumePlan {
            volume_name,
            current_claim: pvc.claim_name.clone(),
            target_claim: target,
        });
    }
    plans
}

/// Computes the set of volumes an in-flight storage migration should
/// still be moving: the instance runs on a claim that differs from the
/// disk's current target. The machine spec is useless for this check
/// once the new claims have been committed to it, so the live claims
/// are the reference.
pub fn plan_in_flight(
    instance_claims: &[(String, String)],
    disks: &[(String, VirtualDisk)],
) -> Vec<VolumePlan> {
    let mut plans = Vec::new();
    for (name, disk) in disks {
        let volume_name = format!("vd-{name}");
        let Some((_, live)) = instance_claims.iter().find(|(n, _)| *n == volume_name) else {
            continue;
        };
        let target = disk
            .status
            .as_ref()
            .map(|s| s.target_pvc_name.clone())
            .unwrap_or_default();
        if target.is_empty() || target == *live {
            continue;
        }
        plans.push(VolumePlan {
            volume_name,
            current_claim: live.clone(),
            target_claim: target,
        });
    }
    plans
}

/// Debounce verdict for a pending volume change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// First sighting: stamp the anchor and wait the full window.
    Stamp,

    /// Anchor set, window not yet elapsed.
    Waiting(Duration),

    /// Window elapsed, commit now.
    Ready,
}

pub fn debounce(
    requested_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> DebounceState {
    let Some(anchor) = requested_at else {
        return DebounceState::Stamp;
    };
    let elapsed = (now - anchor).to_std().unwrap_or_default();
    if elapsed >= window {
        DebounceState::Ready
    } else {
        DebounceState::Waiting(window - elapsed)
    }
}

/// True when the target claim is usable for a storage migration.
///
/// Bound is always ready; a wait-for-first-consumer disk is ready as
/// soon as it is schedulable-pending, which the disk controller
/// reports as the WaitForFirstConsumer phase.
pub fn target_claim_ready(pvc_phase: Option<&str>, disk_phase: DiskPhase) -> bool {
    match pvc_phase {
        Some("Bound") => true,
        Some("Pending") => disk_phase == DiskPhase::WaitForFirstConsumer,
        _ => false,
    }
}

/// Applies the plan to a volume list, swapping claims in place.
pub fn apply_plan(volumes: &[HvmVolume], plans: &[VolumePlan]) -> Vec<HvmVolume> {
    volumes
        .iter()
        .map(|volume| {
            let mut volume = volume.clone();
            if let Some(plan) = plans.iter().find(|p| p.volume_name == volume.name) {
                if let Some(pvc) = &mut volume.persistent_volume_claim {
                    pvc.claim_name = plan.target_claim.clone();
                }
            }
            volume
        })
        .collect()
}

/// True when the set of volumes actually migrating diverged from the
/// expected set. A diverged migration is reverted wholesale to force a
/// clean resync.
pub fn diverged(expected: &[VolumePlan], actually_migrating: &[String]) -> bool {
    if expected.len() != actually_migrating.len() {
        return true;
    }
    expected
        .iter()
        .any(|p| !actually_migrating.iter().any(|name| *name == p.volume_name))
}

#[cfg(test)]
#[path = "migration_volumes_test.rs"]
mod migration_volumes_test;
