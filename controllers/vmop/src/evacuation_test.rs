use super::*;

use crds::{OperationPhase, OperationStatus};

fn operation(vm: &str, type_: OperationType, phase: OperationPhase) -> VirtualMachineOperation {
    VirtualMachineOperation {
        metadata: ObjectMeta::default(),
        spec: VirtualMachineOperationSpec {
            type_,
            virtual_machine: vm.to_owned(),
            force: false,
        },
        status: Some(OperationStatus {
            phase,
            ..Default::default()
        }),
    }
}

#[test]
fn marked_instance_without_coverage_gets_a_request() {
    assert!(needs_evacuation_request("node-a", "web", &[]));
}

#[test]
fn unmarked_instance_never_gets_a_request() {
    assert!(!needs_evacuation_request("", "web", &[]));
}

#[test]
fn active_migration_for_the_same_machine_dedups() {
    let ops = vec![operation("web", OperationType::Evict, OperationPhase::InProgress)];
    assert!(!needs_evacuation_request("node-a", "web", &ops));
}

#[test]
fn user_migration_also_counts_as_coverage() {
    let ops = vec![operation("web", OperationType::Migrate, OperationPhase::Pending)];
    assert!(!needs_evacuation_request("node-a", "web", &ops));
}

#[test]
fn finished_or_foreign_operations_do_not_count() {
    let ops = vec![
        operation("web", OperationType::Evict, OperationPhase::Completed),
        operation("other", OperationType::Evict, OperationPhase::InProgress),
        operation("web", OperationType::Restart, OperationPhase::InProgress),
    ];
    assert!(needs_evacuation_request("node-a", "web", &ops));
}
