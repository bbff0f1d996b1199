//! Shutdown reason detection from launcher pods.
//!
//! When an instance stops, the reason matters for power policy: a
//! guest-initiated reset must be revived even under policies that
//! otherwise respect a clean shutdown.

use k8s_openapi::api::core::v1::Pod;

/// Name of the container running the guest inside a launcher pod.
const COMPUTE_CONTAINER: &str = "compute";

/// Termination message the hypervisor writes on a guest-initiated reset.
const GUEST_RESET_MESSAGE: &str = "guest-reset";

/// Why the instance last went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownInfo {
    /// A launcher pod ran to completion.
    pub pod_completed: bool,

    /// The guest asked for a reset rather than a plain shutdown.
    pub guest_reset: bool,
}

impl ShutdownInfo {
    pub fn none() -> Self {
        Self {
            pod_completed: false,
            guest_reset: false,
        }
    }
}

/// Derives shutdown info from the machine's launcher pods.
///
/// Pods are expected newest first; the most recent completed pod wins.
pub fn inspect_pods(pods: &[Pod]) -> ShutdownInfo {
    for pod in pods {
        let Some(status) = &pod.status else { continue };
        let completed = matches!(status.phase.as_deref(), Some("Succeeded") | Some("Failed"));
        if !completed {
            continue;
        }

        let guest_reset = status
            .container_statuses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|cs| cs.name == COMPUTE_CONTAINER)
            .filter_map(|cs| cs.state.as_ref())
            .filter_map(|state| state.terminated.as_ref())
            .any(|t| {
                t.message
                    .as_deref()
                    .is_some_and(|m| m.contains(GUEST_RESET_MESSAGE))
            });

        return ShutdownInfo {
            pod_completed: true,
            guest_reset,
        };
    }
    ShutdownInfo::none()
}

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_test;
