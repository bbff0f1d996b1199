//! Operation phase machine.
//!
//! Pending → InProgress → {Completed, Failed}, Terminating on
//! deletion. Admission runs while Pending; the signal is delivered on
//! the transition to InProgress; progress while InProgress is mirrored
//! from the lower-level migration (for migration operations) or from
//! the machine phase (for power operations).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

use crds::hypervisor::{HvmMigrationPhase, HypervisorVmMigration, HypervisorVmMigrationSpec};
use crds::operation::op_condition;
use crds::virtual_machine::{vm_annotation, MachinePhase, RunPolicy};
use crds::{
    finalizer, vm_condition, Condition, ConditionStatus, HypervisorVirtualMachineInstance,
    OperationPhase, OperationType, VirtualMachine, VirtualMachineOperation, LABEL_MIGRATION_VMI,
};
use reconciler::ReconciledResource;

use crate::error::ControllerError;

/// Field manager of every status write this controller performs.
const FIELD_MANAGER: &str = "vmops-vmop-controller";

/// Poll interval while an operation is in progress.
const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Poll interval while an operation waits on another one.
const WAIT_REQUEUE: Duration = Duration::from_secs(15);

/// Admission verdict over a Pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,

    /// Terminal rejection: phase becomes Failed.
    Reject { reason: &'static str, message: String },

    /// Stay Pending until the blocking operation finishes.
    Wait(String),
}

/// Pure admission check. `other_migrations` counts non-final
/// migration-shaped operations targeting the same machine, this one
/// excluded.
///
/// Forced Evict is rejected outright: no per-machine policy is
/// modeled yet that would let a system eviction skip the guest grace
/// period, so `force` has no meaning there.
pub fn admit(
    op_type: OperationType,
    force: bool,
    vm_phase: MachinePhase,
    run_policy: RunPolicy,
    migratable: bool,
    other_migrations: usize,
) -> Admission {
    if op_type.is_migration() {
        if other_migrations > 0 {
            return Admission::Wait(
                "Another migration is already in progress for this VirtualMachine.".to_owned(),
            );
        }
        if !migratable {
            return Admission::Reject {
                reason: op_condition::REASON_FAILED,
                message: "VirtualMachine is not migratable.".to_owned(),
            };
        }
        if vm_phase != MachinePhase::Running {
            return Admission::Reject {
                reason: op_condition::REASON_NOT_APPLICABLE,
                message: format!("VirtualMachine in phase {vm_phase:?} cannot be migrated."),
            };
        }
        // System evictions never skip the guest grace period.
        if force && op_type == OperationType::Evict {
            return Admission::Reject {
                reason: op_condition::REASON_FAILED,
                message: "Forced eviction is not allowed.".to_owned(),
            };
        }
        return Admission::Allow;
    }

    match op_type {
        OperationType::Start => {
            if run_policy == RunPolicy::AlwaysOff {
                Admission::Reject {
                    reason: op_condition::REASON_NOT_APPLICABLE,
                    message: "Run policy AlwaysOff forbids starting.".to_owned(),
                }
            } else if vm_phase == MachinePhase::Stopped {
                Admission::Allow
            } else {
                Admission::Reject {
                    reason: op_condition::REASON_NOT_APPLICABLE,
                    message: format!("VirtualMachine in phase {vm_phase:?} cannot be started."),
                }
            }
        }
        OperationType::Stop | OperationType::Restart => {
            if run_policy == RunPolicy::AlwaysOn && op_type == OperationType::Stop {
                Admission::Reject {
                    reason: op_condition::REASON_NOT_APPLICABLE,
                    message: "Run policy AlwaysOn forbids stopping.".to_owned(),
                }
            } else if matches!(vm_phase, MachinePhase::Running | MachinePhase::Starting) {
                Admission::Allow
            } else {
                Admission::Reject {
                    reason: op_condition::REASON_NOT_APPLICABLE,
                    message: format!(
                        "VirtualMachine in phase {vm_phase:?} cannot be {}.",
                        if op_type == OperationType::Stop {
                            "stopped"
                        } else {
                            "restarted"
                        }
                    ),
                }
            }
        }
        // Handled above.
        OperationType::Migrate | OperationType::Evict => Admission::Allow,
    }
}

/// Pure completion check for the power operations. `signaled_uid` is
/// the instance the signal went to; Start and Stop ignore it, Restart
/// waits for a replacement instance to come up.
pub fn power_goal_reached(
    op_type: OperationType,
    vm_phase: MachinePhase,
    signaled_uid: &str,
    instance_uid: Option<&str>,
) -> bool {
    match op_type {
        OperationType::Stop => vm_phase == MachinePhase::Stopped,
        OperationType::Start => vm_phase == MachinePhase::Running,
        OperationType::Restart => {
            vm_phase == MachinePhase::Running
                && instance_uid.is_some_and(|uid| uid != signaled_uid)
        }
        _ => false,
    }
}

/// Maps hypervisor failure text onto the user-facing message.
pub fn normalize_failure(reason: &str) -> String {
    let lowered = reason.to_lowercase();
    if lowered.contains("does not exist") || lowered.contains("is shut down") {
        "VirtualMachine is stopped.".to_owned()
    } else if reason.is_empty() {
        "Migration failed.".to_owned()
    } else {
        reason.to_owned()
    }
}

/// Runs the phase machine for one operation at a time.
pub struct OpReconciler {
    client: Client,
}

impl OpReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn reconcile(
        &self,
        op: Arc<VirtualMachineOperation>,
    ) -> Result<Action, ControllerError> {
        let name = op.name_any();
        let namespace = op.namespace().unwrap_or_default();
        let api: Api<VirtualMachineOperation> = Api::namespaced(self.client.clone(), &namespace);

        let Some(fresh) = api.get_opt(&name).await? else {
            debug!("VirtualMachineOperation {namespace}/{name} is gone");
            return Ok(Action::await_change());
        };

        if fresh.metadata.deletion_timestamp.is_some() {
            return self.finish_deletion(&api, &namespace, fresh).await;
        }

        let mut op = ReconciledResource::new(fresh);
        let phase = op.current.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase.is_terminal() {
            return Ok(Action::await_change());
        }

        ensure_finalizer(&api, &op.current).await?;

        let action = match phase {
            OperationPhase::Pending => self.run_admission(&namespace, &mut op).await?,
            OperationPhase::InProgress => self.track_progress(&namespace, &mut op).await?,
            // Deletion is handled above; terminal phases return early.
            _ => Action::await_change(),
        };

        op.persist_status(&api, FIELD_MANAGER).await?;
        Ok(action)
    }

    async fn run_admission(
        &self,
        namespace: &str,
        op: &mut ReconciledResource<VirtualMachineOperation>,
    ) -> Result<Action, ControllerError> {
        let generation = op.current.metadata.generation.unwrap_or_default();
        let op_name = op.current.name_any();
        let vm_name = op.current.spec.virtual_machine.clone();
        let op_type = op.current.spec.type_;
        let force = op.current.spec.force;

        let vm_api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let Some(vm) = vm_api.get_opt(&vm_name).await? else {
            fail(op, generation, op_condition::REASON_FAILED, format!(
                "VirtualMachine \"{vm_name}\" not found."
            ));
            return Ok(Action::await_change());
        };

        let vm_status = vm.status.clone().unwrap_or_default();
        let migratable = vm_status.conditions.is_true(vm_condition::TYPE_MIGRATABLE);
        let other_migrations = self
            .other_active_migrations(namespace, &vm_name, &op_name)
            .await?;

        match admit(
            op_type,
            force,
            vm_status.phase,
            vm.spec.run_policy,
            migratable,
            other_migrations,
        ) {
            Admission::Reject { reason, message } => {
                info!(
                    "VirtualMachineOperation {namespace}/{op_name} rejected: {message}"
                );
                fail(op, generation, reason, message);
                Ok(Action::await_change())
            }
            Admission::Wait(message) => {
                op.status_mut().conditions.set(Condition {
                    type_: op_condition::TYPE_COMPLETED.to_owned(),
                    status: ConditionStatus::False,
                    reason: op_condition::REASON_WAIT_FOR_OTHER_OPERATIONS.to_owned(),
                    message,
                    observed_generation: generation,
                    last_transition_time: None,
                });
                Ok(Action::requeue(WAIT_REQUEUE))
            }
            Admission::Allow => {
                self.deliver_signal(namespace, op, &vm).await?;
                op.status_mut().phase = OperationPhase::InProgress;
                op.status_mut().conditions.set(Condition {
                    type_: op_condition::TYPE_SIGNAL_SENT.to_owned(),
                    status: ConditionStatus::True,
                    reason: op_condition::REASON_SIGNAL_SENT.to_owned(),
                    message: String::new(),
                    observed_generation: generation,
                    last_transition_time: None,
                });
                op.status_mut().observed_generation = generation;
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
    }

    /// Sends the imperative signal exactly once, on the Pending to
    /// InProgress transition.
    async fn deliver_signal(
        &self,
        namespace: &str,
        op: &mut ReconciledResource<VirtualMachineOperation>,
        vm: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        let op_name = op.current.name_any();
        let vm_name = vm.name_any();
        match op.current.spec.type_ {
            OperationType::Start => {
                self.annotate_vm(namespace, &vm_name, vm_annotation::START_REQUESTED)
                    .await
            }
            OperationType::Restart => {
                // The machine phase is already Running when the restart
                // is requested; progress is judged against the instance
                // identity, so remember which instance got the signal.
                op.status_mut().signaled_instance_uid =
                    self.instance_uid(namespace, &vm_name).await?.unwrap_or_default();
                self.annotate_vm(namespace, &vm_name, vm_annotation::RESTART_REQUESTED)
                    .await
            }
            OperationType::Stop => {
                info!("VirtualMachineOperation {namespace}/{op_name}: stopping {vm_name}");
                let api: Api<HypervisorVirtualMachineInstance> =
                    Api::namespaced(self.client.clone(), namespace);
                match api.delete(&vm_name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            OperationType::Migrate | OperationType::Evict => {
                self.create_migration(namespace, op, vm).await?;
                if op.current.spec.type_ == OperationType::Evict {
                    let generation = op.current.metadata.generation.unwrap_or_default();
                    op.status_mut().conditions.set(Condition {
                        type_: op_condition::TYPE_EVACUATION.to_owned(),
                        status: ConditionStatus::True,
                        reason: op_condition::REASON_SIGNAL_SENT.to_owned(),
                        message: String::new(),
                        observed_generation: generation,
                        last_transition_time: None,
                    });
                }
                Ok(())
            }
        }
    }

    async fn annotate_vm(
        &self,
        namespace: &str,
        vm_name: &str,
        annotation: &str,
    ) -> Result<(), ControllerError> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { annotation: Utc::now().to_rfc3339() } }
        });
        api.patch(vm_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Creates the lower-level migration named after the operation.
    async fn create_migration(
        &self,
        namespace: &str,
        op: &ReconciledResource<VirtualMachineOperation>,
        vm: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        let api: Api<HypervisorVmMigration> = Api::namespaced(self.client.clone(), namespace);
        let name = op.current.name_any();
        if api.get_opt(&name).await?.is_some() {
            return Ok(());
        }
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MIGRATION_VMI.to_owned(), vm.name_any());
        let migration = HypervisorVmMigration {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_owned()),
                labels: Some(labels),
                owner_references: Some(vec![owner_reference(&op.current)]),
                ..Default::default()
            },
            spec: HypervisorVmMigrationSpec {
                vmi_name: vm.name_any(),
            },
            status: None,
        };
        info!("Creating hypervisor migration {namespace}/{name}");
        api.create(&PostParams::default(), &migration).await?;
        Ok(())
    }

    async fn track_progress(
        &self,
        namespace: &str,
        op: &mut ReconciledResource<VirtualMachineOperation>,
    ) -> Result<Action, ControllerError> {
        if op.current.spec.type_.is_migration() {
            self.track_migration(namespace, op).await
        } else {
            self.track_power(namespace, op).await
        }
    }

    async fn track_migration(
        &self,
        namespace: &str,
        op: &mut ReconciledResource<VirtualMachineOperation>,
    ) -> Result<Action, ControllerError> {
        let generation = op.current.metadata.generation.unwrap_or_default();
        let name = op.current.name_any();
        let api: Api<HypervisorVmMigration> = Api::namespaced(self.client.clone(), namespace);
        let Some(migration) = api.get_opt(&name).await? else {
            fail(op, generation, op_condition::REASON_FAILED,
                "The underlying migration disappeared.".to_owned());
            return Ok(Action::await_change());
        };

        let status = migration.status.clone().unwrap_or_default();
        match status.phase {
            HvmMigrationPhase::Succeeded => {
                op.status_mut().phase = OperationPhase::Completed;
                op.status_mut().conditions.set(Condition {
                    type_: op_condition::TYPE_COMPLETED.to_owned(),
                    status: ConditionStatus::True,
                    reason: op_condition::REASON_COMPLETED.to_owned(),
                    message: String::new(),
                    observed_generation: generation,
                    last_transition_time: None,
                });
                Ok(Action::await_change())
            }
            HvmMigrationPhase::Failed => {
                let reason = status
                    .migration_state
                    .as_ref()
                    .map(|s| s.failure_reason.clone())
                    .unwrap_or_default();
                fail(op, generation, op_condition::REASON_FAILED, normalize_failure(&reason));
                Ok(Action::await_change())
            }
            phase => {
                let (reason, mut message) = match phase {
                    HvmMigrationPhase::Unset
                    | HvmMigrationPhase::Pending
                    | HvmMigrationPhase::Scheduling => {
                        (op_condition::REASON_QUEUED, "Migration is queued.".to_owned())
                    }
                    HvmMigrationPhase::PreparingTarget => (
                        op_condition::REASON_PREPARING_TARGET,
                        "Preparing the migration target.".to_owned(),
                    ),
                    HvmMigrationPhase::TargetReady => (
                        op_condition::REASON_TARGET_READY,
                        "Migration target is ready.".to_owned(),
                    ),
                    HvmMigrationPhase::Running => (
                        op_condition::REASON_MIGRATION_RUNNING,
                        "Migration is running.".to_owned(),
                    ),
                    // Terminal phases matched above.
                    _ => (op_condition::REASON_QUEUED, String::new()),
                };
                if status
                    .migration_state
                    .as_ref()
                    .is_some_and(|s| s.target_pod_unschedulable)
                {
                    message = "Migration target pod is unschedulable.".to_owned();
                }
                op.status_mut().conditions.set(Condition {
                    type_: op_condition::TYPE_COMPLETED.to_owned(),
                    status: ConditionStatus::False,
                    reason: reason.to_owned(),
                    message,
                    observed_generation: generation,
                    last_transition_time: None,
                });
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
    }

    async fn track_power(
        &self,
        namespace: &str,
        op: &mut ReconciledResource<VirtualMachineOperation>,
    ) -> Result<Action, ControllerError> {
        let generation = op.current.metadata.generation.unwrap_or_default();
        let vm_name = op.current.spec.virtual_machine.clone();
        let vm_api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let Some(vm) = vm_api.get_opt(&vm_name).await? else {
            fail(op, generation, op_condition::REASON_FAILED, format!(
                "VirtualMachine \"{vm_name}\" disappeared."
            ));
            return Ok(Action::await_change());
        };

        let phase = vm.status.as_ref().map(|s| s.phase).unwrap_or_default();
        let signaled_uid = op
            .current
            .status
            .as_ref()
            .map(|s| s.signaled_instance_uid.clone())
            .unwrap_or_default();
        let instance_uid = if op.current.spec.type_ == OperationType::Restart {
            self.instance_uid(namespace, &vm_name).await?
        } else {
            None
        };
        if power_goal_reached(
            op.current.spec.type_,
            phase,
            &signaled_uid,
            instance_uid.as_deref(),
        ) {
            op.status_mut().phase = OperationPhase::Completed;
            op.status_mut().conditions.set(Condition {
                type_: op_condition::TYPE_COMPLETED.to_owned(),
                status: ConditionStatus::True,
                reason: op_condition::REASON_COMPLETED.to_owned(),
                message: String::new(),
                observed_generation: generation,
                last_transition_time: None,
            });
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(PROGRESS_REQUEUE))
        }
    }

    /// UID of the live instance backing the machine, if one exists.
    async fn instance_uid(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Result<Option<String>, ControllerError> {
        let api: Api<HypervisorVirtualMachineInstance> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(vm_name).await?.and_then(|i| i.metadata.uid))
    }

    async fn other_active_migrations(
        &self,
        namespace: &str,
        vm_name: &str,
        own_name: &str,
    ) -> Result<usize, ControllerError> {
        let api: Api<VirtualMachineOperation> = Api::namespaced(self.client.clone(), namespace);
        let all = api.list(&Default::default()).await?.items;
        Ok(all
            .iter()
            .filter(|other| {
                other.name_any() != own_name
                    && other.spec.virtual_machine == vm_name
                    && other.spec.type_.is_migration()
                    && !other
                        .status
                        .as_ref()
                        .map(|s| s.phase)
                        .unwrap_or_default()
                        .is_terminal()
                    && other.metadata.deletion_timestamp.is_none()
            })
            .count())
    }

    /// Deletion path: the lower-level migration goes first, and the
    /// finalizer comes off only once its absence is confirmed.
    async fn finish_deletion(
        &self,
        api: &Api<VirtualMachineOperation>,
        namespace: &str,
        op: VirtualMachineOperation,
    ) -> Result<Action, ControllerError> {
        let name = op.name_any();
        if op.status.as_ref().map(|s| s.phase).unwrap_or_default() != OperationPhase::Terminating {
            let patch = serde_json::json!({ "status": { "phase": OperationPhase::Terminating } });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        if op.spec.type_.is_migration() {
            let migration_api: Api<HypervisorVmMigration> =
                Api::namespaced(self.client.clone(), namespace);
            match migration_api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            if migration_api.get_opt(&name).await?.is_some() {
                debug!(
                    "VirtualMachineOperation {namespace}/{name}: waiting for migration teardown"
                );
                return Ok(Action::requeue(Duration::from_secs(2)));
            }
        }
        remove_finalizer(api, &op).await?;
        info!("VirtualMachineOperation {namespace}/{name} cleanup finished");
        Ok(Action::await_change())
    }
}

fn fail(
    op: &mut ReconciledResource<VirtualMachineOperation>,
    generation: i64,
    reason: &str,
    message: String,
) {
    op.status_mut().phase = OperationPhase::Failed;
    op.status_mut().conditions.set(Condition {
        type_: op_condition::TYPE_COMPLETED.to_owned(),
        status: ConditionStatus::False,
        reason: reason.to_owned(),
        message,
        observed_generation: generation,
        last_transition_time: None,
    });
    op.status_mut().observed_generation = generation;
}

async fn ensure_finalizer(
    api: &Api<VirtualMachineOperation>,
    op: &VirtualMachineOperation,
) -> Result<(), ControllerError> {
    if op.finalizers().iter().any(|f| f == finalizer::VMOP_CLEANUP) {
        return Ok(());
    }
    let mut finalizers = op.finalizers().to_vec();
    finalizers.push(finalizer::VMOP_CLEANUP.to_owned());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&op.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(
    api: &Api<VirtualMachineOperation>,
    op: &VirtualMachineOperation,
) -> Result<(), ControllerError> {
    if !op.finalizers().iter().any(|f| f == finalizer::VMOP_CLEANUP) {
        return Ok(());
    }
    let finalizers: Vec<_> = op
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer::VMOP_CLEANUP)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&op.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn owner_reference(op: &VirtualMachineOperation) -> OwnerReference {
    OwnerReference {
        api_version: VirtualMachineOperation::api_version(&()).into_owned(),
        kind: VirtualMachineOperation::kind(&()).into_owned(),
        name: op.name_any(),
        uid: op.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
