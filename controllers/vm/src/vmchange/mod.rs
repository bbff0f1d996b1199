//! Structured diffing of VirtualMachine specs.
//!
//! The synchronizer compares the last applied spec against the current
//! one and classifies every changed field: does applying it require a
//! guest restart, can it be applied to the running machine, or is it
//! consumed elsewhere entirely. The classification table is the
//! contract for restart-approval behavior, so every spec field must be
//! covered here.

mod compare;

pub use compare::{compare_specs, DEFAULT_CORE_FRACTION, DEFAULT_GRACE_PERIOD_SECONDS};

use serde_json::Value;

use crds::virtual_machine::PendingChange;

/// How a single field change is applied.
///
/// Ordered by severity: the whole-diff action is the maximum over all
/// field changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionType {
    /// Consumed by another handler or irrelevant to the hypervisor
    /// machine; never triggers a write by itself.
    None,

    /// Safe to apply to a running machine.
    ApplyImmediate,

    /// Takes effect only across a guest restart.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Add,
    Remove,
    Replace,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Add => "add",
            ChangeOperation::Remove => "remove",
            ChangeOperation::Replace => "replace",
        }
    }
}

/// One changed spec field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub operation: ChangeOperation,
    pub path: &'static str,
    pub current_value: Option<Value>,
    pub desired_value: Option<Value>,
    pub action: ActionType,
}

/// The classified diff between two specs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecChanges(Vec<FieldChange>);

impl SpecChanges {
    pub fn push(&mut self, change: FieldChange) {
        self.0.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.0
    }

    /// The action required to apply the whole diff.
    pub fn action(&self) -> ActionType {
        self.0
            .iter()
            .map(|c| c.action)
            .max()
            .unwrap_or(ActionType::None)
    }

    pub fn is_disruptive(&self) -> bool {
        self.action() == ActionType::Restart
    }

    /// The restart-requiring changes, in status form.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.0
            .iter()
            .filter(|c| c.action == ActionType::Restart)
            .map(|c| PendingChange {
                operation: c.operation.as_str().to_owned(),
                path: c.path.to_owned(),
                current_value: c.current_value.clone(),
                desired_value: c.desired_value.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod compare_test;
