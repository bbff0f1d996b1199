use crds::virtual_machine::RestartApprovalMode;

use crate::vmchange::{compare_specs, ActionType};

use super::*;

fn changes(action: ActionType) -> SpecChanges {
    let current = crds::virtual_machine::VirtualMachineSpec {
        memory: crds::virtual_machine::MemorySpec { size: "2Gi".into() },
        ..Default::default()
    };
    let mut desired = current.clone();
    match action {
        ActionType::None => {}
        ActionType::ApplyImmediate => {
            desired.run_policy = crds::virtual_machine::RunPolicy::AlwaysOff;
        }
        ActionType::Restart => desired.memory.size = "8Gi".into(),
    }
    compare_specs(&current, &desired)
}

#[test]
fn stopped_machine_is_always_updated() {
    // Even with an empty diff: backing resources may have changed.
    let decision = decide(
        &changes(ActionType::None),
        false,
        true,
        false,
        RestartApprovalMode::Manual,
    );
    assert_eq!(
        decision,
        SyncDecision::Update {
            delete_stuck_pod: false
        }
    );
}

#[test]
fn empty_diff_on_a_running_machine_does_nothing() {
    let decision = decide(
        &changes(ActionType::None),
        true,
        false,
        false,
        RestartApprovalMode::Manual,
    );
    assert_eq!(decision, SyncDecision::Nothing);
}

#[test]
fn non_disruptive_diff_applies_immediately() {
    let decision = decide(
        &changes(ActionType::ApplyImmediate),
        true,
        false,
        false,
        RestartApprovalMode::Manual,
    );
    assert_eq!(
        decision,
        SyncDecision::Update {
            delete_stuck_pod: false
        }
    );
}

#[test]
fn disruptive_diff_on_a_running_machine_is_deferred() {
    let decision = decide(
        &changes(ActionType::Restart),
        true,
        false,
        false,
        RestartApprovalMode::Manual,
    );
    assert_eq!(decision, SyncDecision::Defer);
}

#[test]
fn disruptive_diff_with_automatic_approval_restarts() {
    let decision = decide(
        &changes(ActionType::Restart),
        true,
        false,
        false,
        RestartApprovalMode::Automatic,
    );
    assert_eq!(decision, SyncDecision::UpdateAndRestart);
}

#[test]
fn disruptive_diff_without_a_running_instance_applies() {
    let decision = decide(
        &changes(ActionType::Restart),
        false,
        false,
        false,
        RestartApprovalMode::Manual,
    );
    assert_eq!(
        decision,
        SyncDecision::Update {
            delete_stuck_pod: false
        }
    );
}

#[test]
fn placement_change_on_unschedulable_machine_forces_update() {
    let current = crds::virtual_machine::VirtualMachineSpec::default();
    let mut desired = current.clone();
    desired.virtual_machine_class_name = "bigger".into();
    let placement_changes = compare_specs(&current, &desired);

    let decision = decide(
        &placement_changes,
        true,
        false,
        true,
        RestartApprovalMode::Manual,
    );
    assert_eq!(
        decision,
        SyncDecision::Update {
            delete_stuck_pod: true
        }
    );
}
