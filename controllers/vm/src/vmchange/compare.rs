//! Field-by-field spec comparison.

use serde_json::{json, Value};

use crds::virtual_machine::{RestartApprovalMode, VirtualMachineSpec};

use super::{ActionType, ChangeOperation, FieldChange, SpecChanges};

/// Default guest grace period applied when the spec leaves it unset.
pub const DEFAULT_GRACE_PERIOD_SECONDS: i64 = 60;

/// Default CPU core fraction applied when the spec leaves it unset.
pub const DEFAULT_CORE_FRACTION: &str = "100%";

/// Compares two specs, classifying every changed field.
///
/// Defaults are normalized before comparing so that writing out an
/// implicit default (e.g. setting `coreFraction` to "100%") never
/// registers as a change.
pub fn compare_specs(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> SpecChanges {
    let mut changes = SpecChanges::default();
    let mut field = |path: &'static str, cur: Value, des: Value, action: ActionType| {
        compare_field(&mut changes, path, cur, des, action);
    };

    field(
        ".virtualMachineClassName",
        json!(current.virtual_machine_class_name),
        json!(desired.virtual_machine_class_name),
        ActionType::Restart,
    );
    field(
        ".virtualMachineIPAddress",
        json!(current.virtual_machine_ip_address),
        json!(desired.virtual_machine_ip_address),
        ActionType::Restart,
    );
    field(
        ".terminationGracePeriodSeconds",
        json!(
            current
                .termination_grace_period_seconds
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS)
        ),
        json!(
            desired
                .termination_grace_period_seconds
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS)
        ),
        ActionType::Restart,
    );
    field(
        ".enableParavirtualization",
        json!(current.enable_paravirtualization),
        json!(desired.enable_paravirtualization),
        ActionType::Restart,
    );
    field(
        ".osType",
        json!(current.os_type),
        json!(desired.os_type),
        ActionType::Restart,
    );
    field(
        ".bootloader",
        json!(current.bootloader),
        json!(desired.bootloader),
        ActionType::Restart,
    );
    field(
        ".cpu.cores",
        json!(current.cpu.cores),
        json!(desired.cpu.cores),
        ActionType::Restart,
    );
    field(
        ".cpu.coreFraction",
        json!(effective_core_fraction(&current.cpu.core_fraction)),
        json!(effective_core_fraction(&desired.cpu.core_fraction)),
        ActionType::Restart,
    );
    field(
        ".memory.size",
        json!(current.memory.size),
        json!(desired.memory.size),
        ActionType::Restart,
    );
    field(
        ".provisioning",
        json!(current.provisioning),
        json!(desired.provisioning),
        ActionType::Restart,
    );
    field(
        ".blockDeviceRefs",
        json!(current.block_device_refs),
        json!(desired.block_device_refs),
        ActionType::Restart,
    );
    field(
        ".networks",
        json!(current.networks),
        json!(desired.networks),
        ActionType::Restart,
    );
    field(
        ".runPolicy",
        json!(current.run_policy),
        json!(desired.run_policy),
        ActionType::ApplyImmediate,
    );
    // The hotplug coordinator owns USB changes at runtime.
    field(
        ".usbDevices",
        json!(current.usb_devices),
        json!(desired.usb_devices),
        ActionType::None,
    );
    field(
        ".disruptions.restartApprovalMode",
        json!(effective_approval_mode(current)),
        json!(effective_approval_mode(desired)),
        ActionType::None,
    );

    changes
}

fn effective_core_fraction(fraction: &str) -> String {
    if fraction.is_empty() {
        DEFAULT_CORE_FRACTION.to_owned()
    } else {
        fraction.to_owned()
    }
}

fn effective_approval_mode(spec: &VirtualMachineSpec) -> RestartApprovalMode {
    spec.disruptions
        .as_ref()
        .map(|d| d.restart_approval_mode)
        .unwrap_or_default()
}

fn compare_field(
    changes: &mut SpecChanges,
    path: &'static str,
    current: Value,
    desired: Value,
    action: ActionType,
) {
    if current == desired {
        return;
    }
    let operation = match (current.is_null(), desired.is_null()) {
        (true, false) => ChangeOperation::Add,
        (false, true) => ChangeOperation::Remove,
        _ => ChangeOperation::Replace,
    };
    changes.push(FieldChange {
        operation,
        path,
        current_value: (!current.is_null()).then_some(current),
        desired_value: (!desired.is_null()).then_some(desired),
        action,
    });
}
