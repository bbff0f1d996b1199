use super::*;
use crds::hypervisor::{HvmPvcVolumeSource, HvmVolume};
use crds::{VirtualDiskSpec, VirtualDiskStatus};

#[test]
fn migratable_when_instance_agrees_and_no_plan() {
    let verdict = assess_migratability(
        Some((ConditionStatus::True, String::new())),
        &[],
        false,
    );
    assert_eq!(verdict, Migratability::Migratable);
}

#[test]
fn missing_instance_condition_defaults_to_migratable() {
    assert_eq!(assess_migratability(None, &[], false), Migratability::Migratable);
}

#[test]
fn instance_refusal_wins() {
    let verdict = assess_migratability(
        Some((ConditionStatus::False, "CPU model is pinned.".to_owned())),
        &[],
        true,
    );
    assert_eq!(
        verdict,
        Migratability::NonMigratable("CPU model is pinned.".to_owned())
    );
}

#[test]
fn single_writer_hotplug_blocks_even_a_willing_instance() {
    let verdict = assess_migratability(
        Some((ConditionStatus::True, String::new())),
        &["scratch-pvc".to_owned()],
        false,
    );
    assert_eq!(
        verdict,
        Migratability::NonMigratable(
            "Hotplugged single-writer disks block live migration: scratch-pvc.".to_owned()
        )
    );
}

#[test]
fn pending_volume_plan_flips_reason() {
    let verdict = assess_migratability(None, &[], true);
    assert_eq!(verdict, Migratability::DisksShouldBeMigrating);
}

#[test]
fn mirrors_instance_migration_state() {
    let start = Utc::now();
    let state = HvmiMigrationState {
        migration_uid: "u-1".to_owned(),
        start_timestamp: Some(start),
        end_timestamp: None,
        source_node: "node-a".to_owned(),
        source_pod: "launcher-a".to_owned(),
        target_node: "node-b".to_owned(),
        target_pod: "launcher-b".to_owned(),
        completed: false,
        failed: false,
    };
    let mirrored = mirror_migration_state(&state);
    assert_eq!(mirrored.start_timestamp, Some(start));
    assert_eq!(mirrored.end_timestamp, None);
    assert_eq!(mirrored.source.node, "node-a");
    assert_eq!(mirrored.target.pod, "launcher-b");
    assert_eq!(mirrored.result, None);
}

#[test]
fn migration_outcome_maps_to_result() {
    let mut state = HvmiMigrationState {
        completed: true,
        ..Default::default()
    };
    assert_eq!(
        mirror_migration_state(&state).result,
        Some(MigrationResult::Succeeded)
    );
    state.failed = true;
    assert_eq!(
        mirror_migration_state(&state).result,
        Some(MigrationResult::Failed)
    );
}

#[test]
fn moving_volumes_compares_desired_against_live_claims() {
    let volumes = vec![
        HvmVolume {
            name: "vd-root".to_owned(),
            persistent_volume_claim: Some(HvmPvcVolumeSource {
                claim_name: "new-pvc".to_owned(),
                hotpluggable: false,
            }),
            ..Default::default()
        },
        HvmVolume {
            name: "vd-data".to_owned(),
            persistent_volume_claim: Some(HvmPvcVolumeSource {
                claim_name: "data-pvc".to_owned(),
                hotpluggable: false,
            }),
            ..Default::default()
        },
    ];
    let live = vec![
        ("vd-root".to_owned(), "old-pvc".to_owned()),
        ("vd-data".to_owned(), "data-pvc".to_owned()),
    ];
    assert_eq!(moving_volumes(&volumes, &live), vec!["vd-root".to_owned()]);
}

fn disk_with_target(target: &str) -> VirtualDisk {
    let mut disk = VirtualDisk::new("root", VirtualDiskSpec::default());
    disk.status = Some(VirtualDiskStatus {
        target_pvc_name: target.to_owned(),
        ..Default::default()
    });
    disk
}

#[test]
fn committed_storage_migration_is_not_treated_as_diverged() {
    // After the commit the machine spec already carries the target
    // claim while the instance still runs on the old one.
    let volumes = vec![HvmVolume {
        name: "vd-root".to_owned(),
        persistent_volume_claim: Some(HvmPvcVolumeSource {
            claim_name: "new-pvc".to_owned(),
            hotpluggable: false,
        }),
        ..Default::default()
    }];
    let live = vec![("vd-root".to_owned(), "old-pvc".to_owned())];
    let disks = vec![("root".to_owned(), disk_with_target("new-pvc"))];

    let moving = moving_volumes(&volumes, &live);
    assert_eq!(moving, vec!["vd-root".to_owned()]);
    let expected = plan_in_flight(&live, &disks);
    assert_eq!(expected.len(), 1);
    assert!(!diverged(&expected, &moving));
}

#[test]
fn in_flight_volume_the_disks_no_longer_demand_is_diverged() {
    // The instance is moving vd-root, but the disk points back at the
    // claim it already runs on.
    let volumes = vec![HvmVolume {
        name: "vd-root".to_owned(),
        persistent_volume_claim: Some(HvmPvcVolumeSource {
            claim_name: "new-pvc".to_owned(),
            hotpluggable: false,
        }),
        ..Default::default()
    }];
    let live = vec![("vd-root".to_owned(), "old-pvc".to_owned())];
    let disks = vec![("root".to_owned(), disk_with_target("old-pvc"))];

    let moving = moving_volumes(&volumes, &live);
    let expected = plan_in_flight(&live, &disks);
    assert!(expected.is_empty());
    assert!(diverged(&expected, &moving));
}
