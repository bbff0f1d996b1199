//! VirtualMachineOperation CRD
//!
//! One-shot imperative action on a VirtualMachine: start, stop,
//! restart, migrate or evict. Operations are append-only records; the
//! spec is immutable after creation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachineOperation",
    namespaced,
    status = "OperationStatus",
    shortname = "vmop"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineOperationSpec {
    /// Action to perform.
    #[serde(rename = "type")]
    pub type_: OperationType,

    /// Target machine name, in the operation's namespace.
    pub virtual_machine: String,

    /// Skip the guest grace period for Stop/Restart.
    #[serde(default)]
    pub force: bool,
}

/// Imperative action kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum OperationType {
    /// Power the machine on.
    Start,

    /// Power the machine off.
    Stop,

    /// Stop, then start again.
    Restart,

    /// Live-migrate to another node, user initiated.
    Migrate,

    /// Live-migrate off the current node, system initiated.
    Evict,
}

impl OperationType {
    /// True for the migration-shaped operations.
    pub fn is_migration(&self) -> bool {
        matches!(self, OperationType::Migrate | OperationType::Evict)
    }
}

/// Phase of an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum OperationPhase {
    /// Admission checks have not passed yet.
    #[default]
    Pending,

    /// The action has been issued and is running.
    InProgress,

    /// The action finished successfully. Terminal.
    Completed,

    /// The action failed or was rejected. Terminal.
    Failed,

    /// The operation is being deleted.
    Terminating,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationPhase::Completed | OperationPhase::Failed)
    }
}

/// Observed state of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    #[serde(default)]
    pub phase: OperationPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    #[serde(default)]
    pub observed_generation: i64,

    /// UID of the machine instance that was running when the signal
    /// was delivered. A restart completes only once a different
    /// instance reaches Running.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signaled_instance_uid: String,
}

/// Condition types and reasons published on an operation.
pub mod op_condition {
    /// The operation finished, one way or the other.
    pub const TYPE_COMPLETED: &str = "Completed";
    /// A system-initiated eviction is mirrored by this operation.
    pub const TYPE_EVACUATION: &str = "Evacuation";
    /// The imperative signal was delivered to its consumer.
    pub const TYPE_SIGNAL_SENT: &str = "SignalSent";

    pub const REASON_COMPLETED: &str = "Completed";
    pub const REASON_SIGNAL_SENT: &str = "SignalSent";
    pub const REASON_FAILED: &str = "OperationFailed";
    pub const REASON_NOT_APPLICABLE: &str = "NotApplicableForVMPhase";
    pub const REASON_NOT_READY_TO_BE_EXECUTED: &str = "NotReadyToBeExecuted";
    pub const REASON_WAIT_FOR_OTHER_OPERATIONS: &str = "WaitForOtherOperations";

    pub const REASON_QUEUED: &str = "Queued";
    pub const REASON_PREPARING_TARGET: &str = "PreparingTarget";
    pub const REASON_TARGET_READY: &str = "TargetReady";
    pub const REASON_MIGRATION_RUNNING: &str = "Running";
}

/// Annotation marking an operation created by the evacuation watcher
/// rather than a user.
pub const ANNOTATION_EVACUATION: &str = "vmops.io/evacuation";
