use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};

use super::*;

fn pod(phase: &str, termination_message: Option<&str>) -> Pod {
    let container_statuses = termination_message.map(|msg| {
        vec![ContainerStatus {
            name: COMPUTE_CONTAINER.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 0,
                    message: Some(msg.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });
    Pod {
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn running_pods_yield_no_shutdown() {
    let pods = vec![pod("Running", None)];
    assert_eq!(inspect_pods(&pods), ShutdownInfo::none());
}

#[test]
fn completed_pod_without_reset_is_plain_shutdown() {
    let pods = vec![pod("Succeeded", Some("guest-shutdown"))];
    let info = inspect_pods(&pods);
    assert!(info.pod_completed);
    assert!(!info.guest_reset);
}

#[test]
fn guest_reset_is_detected_on_the_newest_completed_pod() {
    let pods = vec![pod("Succeeded", Some("guest-reset")), pod("Succeeded", None)];
    let info = inspect_pods(&pods);
    assert!(info.pod_completed);
    assert!(info.guest_reset);
}

#[test]
fn failed_pod_counts_as_completed() {
    let pods = vec![pod("Failed", None)];
    assert!(inspect_pods(&pods).pod_completed);
}
