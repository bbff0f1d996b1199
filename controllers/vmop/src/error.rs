//! Controller-specific error types.

use thiserror::Error;

/// Errors that can occur in the VirtualMachineOperation controller.
///
/// Rejected operations are not errors: rejection is a terminal phase
/// with a condition. Only infrastructure problems land here.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Persist(#[from] reconciler::PersistError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
