use super::*;

fn inputs() -> PhaseInputs {
    PhaseInputs {
        deleting: false,
        machine_exists: true,
        instance: None,
        migrating: false,
        dependencies_ready: true,
    }
}

#[test]
fn deletion_always_wins() {
    let phase = compute_phase(&PhaseInputs {
        deleting: true,
        instance: Some((HvmiPhase::Running, false)),
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Terminating);
}

#[test]
fn running_instance_is_running() {
    let phase = compute_phase(&PhaseInputs {
        instance: Some((HvmiPhase::Running, false)),
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Running);
}

#[test]
fn scheduling_counts_as_starting() {
    for p in [HvmiPhase::Pending, HvmiPhase::Scheduling, HvmiPhase::Scheduled] {
        let phase = compute_phase(&PhaseInputs {
            instance: Some((p, false)),
            ..inputs()
        });
        assert_eq!(phase, MachinePhase::Starting);
    }
}

#[test]
fn migrating_condition_overrides_running() {
    let phase = compute_phase(&PhaseInputs {
        instance: Some((HvmiPhase::Running, false)),
        migrating: true,
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Migrating);
}

#[test]
fn deleting_instance_is_stopping() {
    let phase = compute_phase(&PhaseInputs {
        instance: Some((HvmiPhase::Running, true)),
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Stopping);
}

#[test]
fn failed_instance_is_degraded() {
    let phase = compute_phase(&PhaseInputs {
        instance: Some((HvmiPhase::Failed, false)),
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Degraded);
}

#[test]
fn no_instance_with_machine_is_stopped() {
    assert_eq!(compute_phase(&inputs()), MachinePhase::Stopped);
}

#[test]
fn guest_address_wins_over_the_lease() {
    assert_eq!(
        resolve_address(Some("10.0.0.5"), Some("10.0.0.2")),
        "10.0.0.5"
    );
}

#[test]
fn lease_address_covers_a_stopped_machine() {
    assert_eq!(resolve_address(None, Some("10.0.0.2")), "10.0.0.2");
    // Instance up but the guest agent has not reported yet.
    assert_eq!(resolve_address(Some(""), Some("10.0.0.2")), "10.0.0.2");
}

#[test]
fn address_empties_once_lease_and_instance_are_gone() {
    assert_eq!(resolve_address(None, None), "");
}

#[test]
fn nothing_created_and_devices_pending_is_pending() {
    let phase = compute_phase(&PhaseInputs {
        machine_exists: false,
        dependencies_ready: false,
        ..inputs()
    });
    assert_eq!(phase, MachinePhase::Pending);
}
