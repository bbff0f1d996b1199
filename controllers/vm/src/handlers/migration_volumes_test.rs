use super::*;
use crds::hypervisor::HvmPvcVolumeSource;
use crds::{VirtualDiskSpec, VirtualDiskStatus};

fn disk(target_pvc: &str) -> VirtualDisk {
    VirtualDisk {
        metadata: Default::default(),
        spec: VirtualDiskSpec::default(),
        status: Some(VirtualDiskStatus {
            target_pvc_name: target_pvc.to_owned(),
            ..Default::default()
        }),
    }
}

fn pvc_volume(name: &str, claim: &str) -> HvmVolume {
    HvmVolume {
        name: name.to_owned(),
        persistent_volume_claim: Some(HvmPvcVolumeSource {
            claim_name: claim.to_owned(),
            hotpluggable: false,
        }),
        ..Default::default()
    }
}

#[test]
fn no_plan_when_claims_match() {
    let volumes = vec![pvc_volume("vd-root", "vd-root-pvc")];
    let disks = vec![("root".to_owned(), disk("vd-root-pvc"))];
    assert!(plan_volume_migration(&volumes, &disks).is_empty());
}

#[test]
fn plans_claim_change() {
    let volumes = vec![pvc_volume("vd-root", "old-pvc")];
    let disks = vec![("root".to_owned(), disk("new-pvc"))];
    let plans = plan_volume_migration(&volumes, &disks);
    assert_eq!(
        plans,
        vec![VolumePlan {
            volume_name: "vd-root".to_owned(),
            current_claim: "old-pvc".to_owned(),
            target_claim: "new-pvc".to_owned(),
        }]
    );
}

#[test]
fn ignores_disks_without_volume_or_target() {
    let volumes = vec![pvc_volume("vd-root", "old-pvc")];
    let disks = vec![
        ("data".to_owned(), disk("somewhere")),
        ("root".to_owned(), disk("")),
    ];
    assert!(plan_volume_migration(&volumes, &disks).is_empty());
}

#[test]
fn debounce_stamps_then_waits_then_fires() {
    let window = Duration::from_secs(5);
    let now = Utc::now();
    assert_eq!(debounce(None, now, window), DebounceState::Stamp);
    match debounce(Some(now - chrono::Duration::seconds(2)), now, window) {
        DebounceState::Waiting(left) => assert_eq!(left, Duration::from_secs(3)),
        other => panic!("expected Waiting, got {other:?}"),
    }
    assert_eq!(
        debounce(Some(now - chrono::Duration::seconds(6)), now, window),
        DebounceState::Ready
    );
}

#[test]
fn wffc_pending_claim_counts_as_ready() {
    assert!(target_claim_ready(Some("Bound"), DiskPhase::Ready));
    assert!(target_claim_ready(
        Some("Pending"),
        DiskPhase::WaitForFirstConsumer
    ));
    assert!(!target_claim_ready(Some("Pending"), DiskPhase::Provisioning));
    assert!(!target_claim_ready(None, DiskPhase::Ready));
}

#[test]
fn apply_plan_swaps_only_planned_claims() {
    let volumes = vec![
        pvc_volume("vd-root", "old-pvc"),
        pvc_volume("vd-data", "data-pvc"),
    ];
    let plans = vec![VolumePlan {
        volume_name: "vd-root".to_owned(),
        current_claim: "old-pvc".to_owned(),
        target_claim: "new-pvc".to_owned(),
    }];
    let updated = apply_plan(&volumes, &plans);
    let claim = |name: &str| {
        updated
            .iter()
            .find(|v| v.name == name)
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .map(|p| p.claim_name.clone())
    };
    assert_eq!(claim("vd-root").as_deref(), Some("new-pvc"));
    assert_eq!(claim("vd-data").as_deref(), Some("data-pvc"));
}

#[test]
fn divergence_detects_extra_and_missing_volumes() {
    let plans = vec![VolumePlan {
        volume_name: "vd-root".to_owned(),
        current_claim: "old".to_owned(),
        target_claim: "new".to_owned(),
    }];
    assert!(!diverged(&plans, &["vd-root".to_owned()]));
    assert!(diverged(&plans, &[]));
    assert!(diverged(&plans, &["vd-data".to_owned()]));
    assert!(diverged(
        &plans,
        &["vd-root".to_owned(), "vd-data".to_owned()]
    ));
}
