//! Kubernetes Event publishing.
//!
//! Events are fire-and-forget: a failed publish is logged and never
//! fails the pass.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crds::VirtualMachine;

pub mod reason {
    pub const STARTED: &str = "Started";
    pub const STOPPED: &str = "Stopped";
    pub const RESTARTED: &str = "Restarted";
    pub const BLOCK_DEVICE_CONFLICT: &str = "BlockDeviceConflict";
    pub const AWAITING_RESTART: &str = "AwaitingRestartApproval";
}

#[derive(Clone)]
pub struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_owned(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, vm: &VirtualMachine, reason: &str, note: String) {
        self.publish(vm, EventType::Normal, reason, note).await;
    }

    pub async fn warning(&self, vm: &VirtualMachine, reason: &str, note: String) {
        self.publish(vm, EventType::Warning, reason, note).await;
    }

    async fn publish(&self, vm: &VirtualMachine, type_: EventType, reason: &str, note: String) {
        let reference: ObjectReference = vm.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: "Reconcile".to_owned(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!("Failed to publish event {reason}: {e}");
        }
    }
}
