use super::*;

fn admit_migrate(
    vm_phase: MachinePhase,
    migratable: bool,
    other_migrations: usize,
) -> Admission {
    admit(
        OperationType::Migrate,
        false,
        vm_phase,
        RunPolicy::AlwaysOn,
        migratable,
        other_migrations,
    )
}

#[test]
fn migration_of_running_migratable_machine_is_allowed() {
    assert_eq!(
        admit_migrate(MachinePhase::Running, true, 0),
        Admission::Allow
    );
}

#[test]
fn migration_of_non_migratable_machine_fails_terminally() {
    let verdict = admit_migrate(MachinePhase::Running, false, 0);
    match verdict {
        Admission::Reject { reason, .. } => {
            assert_eq!(reason, op_condition::REASON_FAILED);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn second_migration_waits_for_the_first() {
    let verdict = admit_migrate(MachinePhase::Running, true, 1);
    assert!(matches!(verdict, Admission::Wait(_)));
}

#[test]
fn migration_of_stopped_machine_is_not_applicable() {
    let verdict = admit_migrate(MachinePhase::Stopped, true, 0);
    match verdict {
        Admission::Reject { reason, .. } => {
            assert_eq!(reason, op_condition::REASON_NOT_APPLICABLE);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn forced_eviction_is_rejected() {
    let verdict = admit(
        OperationType::Evict,
        true,
        MachinePhase::Running,
        RunPolicy::AlwaysOn,
        true,
        0,
    );
    assert!(matches!(verdict, Admission::Reject { .. }));
}

#[test]
fn start_applies_only_to_stopped_machines() {
    assert_eq!(
        admit(
            OperationType::Start,
            false,
            MachinePhase::Stopped,
            RunPolicy::Manual,
            false,
            0,
        ),
        Admission::Allow
    );
    assert!(matches!(
        admit(
            OperationType::Start,
            false,
            MachinePhase::Running,
            RunPolicy::Manual,
            false,
            0,
        ),
        Admission::Reject { .. }
    ));
}

#[test]
fn run_policy_overrides_power_operations() {
    assert!(matches!(
        admit(
            OperationType::Start,
            false,
            MachinePhase::Stopped,
            RunPolicy::AlwaysOff,
            false,
            0,
        ),
        Admission::Reject { .. }
    ));
    assert!(matches!(
        admit(
            OperationType::Stop,
            false,
            MachinePhase::Running,
            RunPolicy::AlwaysOn,
            false,
            0,
        ),
        Admission::Reject { .. }
    ));
}

#[test]
fn stop_and_restart_apply_to_live_machines() {
    assert_eq!(
        admit(
            OperationType::Stop,
            false,
            MachinePhase::Running,
            RunPolicy::Manual,
            false,
            0,
        ),
        Admission::Allow
    );
    assert_eq!(
        admit(
            OperationType::Restart,
            false,
            MachinePhase::Starting,
            RunPolicy::AlwaysOn,
            false,
            0,
        ),
        Admission::Allow
    );
}

#[test]
fn restart_is_not_complete_while_the_signaled_instance_still_runs() {
    // The machine was Running when the restart was requested, so the
    // phase alone cannot prove anything happened.
    assert!(!power_goal_reached(
        OperationType::Restart,
        MachinePhase::Running,
        "uid-old",
        Some("uid-old"),
    ));
    assert!(!power_goal_reached(
        OperationType::Restart,
        MachinePhase::Stopped,
        "uid-old",
        None,
    ));
}

#[test]
fn restart_completes_once_a_replacement_instance_runs() {
    assert!(power_goal_reached(
        OperationType::Restart,
        MachinePhase::Running,
        "uid-old",
        Some("uid-new"),
    ));
    // No instance existed at signal time; any running one counts.
    assert!(power_goal_reached(
        OperationType::Restart,
        MachinePhase::Running,
        "",
        Some("uid-new"),
    ));
}

#[test]
fn start_and_stop_complete_on_phase_alone() {
    assert!(power_goal_reached(
        OperationType::Start,
        MachinePhase::Running,
        "",
        None,
    ));
    assert!(power_goal_reached(
        OperationType::Stop,
        MachinePhase::Stopped,
        "",
        None,
    ));
    assert!(!power_goal_reached(
        OperationType::Stop,
        MachinePhase::Running,
        "",
        None,
    ));
}

#[test]
fn hypervisor_stop_reasons_collapse_to_a_uniform_message() {
    assert_eq!(
        normalize_failure("virtual machine instance does not exist"),
        "VirtualMachine is stopped."
    );
    assert_eq!(
        normalize_failure("guest is shut down"),
        "VirtualMachine is stopped."
    );
}

#[test]
fn other_failure_reasons_pass_through() {
    assert_eq!(normalize_failure("no route to target node"), "no route to target node");
    assert_eq!(normalize_failure(""), "Migration failed.");
}
