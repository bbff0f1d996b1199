//! Controller-specific error types.

use thiserror::Error;

/// Errors that can occur in the VirtualMachine controller.
///
/// Business-rule failures (device not ready, not migratable, class
/// missing) are not errors: they become conditions on the status and
/// the pass completes normally. Only infrastructure problems and
/// invariant violations land here.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Persist(#[from] reconciler::PersistError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed last-applied-spec annotation on {0}: {1}")]
    MalformedLastApplied(String, serde_json::Error),
}
