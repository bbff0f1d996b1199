use super::*;

fn running_instance() -> InstanceView {
    InstanceView {
        exists: true,
        deleting: false,
        phase: Some(HvmiPhase::Running),
    }
}

fn terminal_instance(phase: HvmiPhase) -> InstanceView {
    InstanceView {
        exists: true,
        deleting: false,
        phase: Some(phase),
    }
}

fn no_instance() -> InstanceView {
    InstanceView::default()
}

fn no_shutdown() -> ShutdownInfo {
    ShutdownInfo::none()
}

fn completed(guest_reset: bool) -> ShutdownInfo {
    ShutdownInfo {
        pod_completed: true,
        guest_reset,
    }
}

#[test]
fn always_off_stops_an_existing_instance() {
    let action = decide_power_action(
        RunPolicy::AlwaysOff,
        running_instance(),
        no_shutdown(),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::Stop);
}

#[test]
fn always_off_is_quiet_once_the_instance_is_gone() {
    let action = decide_power_action(
        RunPolicy::AlwaysOff,
        no_instance(),
        completed(false),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::None);
}

#[test]
fn always_on_starts_a_missing_instance() {
    let action = decide_power_action(
        RunPolicy::AlwaysOn,
        no_instance(),
        no_shutdown(),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::Start);
}

#[test]
fn always_on_restarts_terminal_instances() {
    for phase in [HvmiPhase::Succeeded, HvmiPhase::Failed] {
        let action = decide_power_action(
            RunPolicy::AlwaysOn,
            terminal_instance(phase),
            completed(false),
            PowerSignals::default(),
        );
        assert_eq!(action, PowerAction::Restart);
    }
}

#[test]
fn manual_never_starts_spontaneously() {
    let action = decide_power_action(
        RunPolicy::Manual,
        no_instance(),
        no_shutdown(),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::None);
}

#[test]
fn manual_starts_on_explicit_request() {
    let action = decide_power_action(
        RunPolicy::Manual,
        no_instance(),
        no_shutdown(),
        PowerSignals {
            start_requested: true,
            restart_requested: false,
        },
    );
    assert_eq!(action, PowerAction::Start);
}

#[test]
fn manual_honors_a_guest_reset() {
    let action = decide_power_action(
        RunPolicy::Manual,
        terminal_instance(HvmiPhase::Succeeded),
        completed(true),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::Restart);
}

#[test]
fn unless_stopped_manually_respects_a_clean_shutdown() {
    let action = decide_power_action(
        RunPolicy::AlwaysOnUnlessStoppedManually,
        no_instance(),
        completed(false),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::None);
}

#[test]
fn unless_stopped_manually_revives_a_guest_reset() {
    let action = decide_power_action(
        RunPolicy::AlwaysOnUnlessStoppedManually,
        no_instance(),
        completed(true),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::Start);
}

#[test]
fn unless_stopped_manually_restarts_failed_instances() {
    let action = decide_power_action(
        RunPolicy::AlwaysOnUnlessStoppedManually,
        terminal_instance(HvmiPhase::Failed),
        no_shutdown(),
        PowerSignals::default(),
    );
    assert_eq!(action, PowerAction::Restart);
}

#[test]
fn restart_request_applies_to_a_running_instance() {
    let action = decide_power_action(
        RunPolicy::AlwaysOn,
        running_instance(),
        no_shutdown(),
        PowerSignals {
            start_requested: false,
            restart_requested: true,
        },
    );
    assert_eq!(action, PowerAction::Restart);
}
