//! Reconciliation driver.
//!
//! One pass fetches the machine fresh, seeds missing conditions as
//! Unknown, runs the handler chain in its fixed order against one
//! shared working copy, and persists the status exactly once at the
//! end, even when a handler failed mid-chain.

use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crds::virtual_machine::vm_condition;
use crds::VirtualMachine;
use reconciler::{add_all_unknown, earliest_requeue, HandlerFlow, ReconciledResource};

use crate::error::ControllerError;
use crate::events::EventRecorder;
use crate::handlers::block_device::SpecAttachmentCounter;
use crate::handlers::{self, VmContext};
use crate::hypervisor_client::HypervisorClient;
use crate::state::VmState;

/// Field manager of every status write this controller performs.
const FIELD_MANAGER: &str = "vmops-vm-controller";

/// Fallback resync when no handler asked for an earlier requeue.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue after seeding Unknown conditions.
const BOOTSTRAP_REQUEUE: Duration = Duration::from_secs(1);

/// Condition types every machine carries from its first pass on.
const ALL_CONDITION_TYPES: &[&str] = &[
    vm_condition::TYPE_BLOCK_DEVICES_READY,
    vm_condition::TYPE_CONFIGURATION_APPLIED,
    vm_condition::TYPE_AWAITING_RESTART,
    vm_condition::TYPE_MIGRATABLE,
    vm_condition::TYPE_MIGRATING,
    vm_condition::TYPE_IP_ADDRESS_READY,
    vm_condition::TYPE_CLASS_READY,
    vm_condition::TYPE_PROVISIONING_READY,
];

/// Runs the handler chain for one VirtualMachine at a time.
pub struct Reconciler<H> {
    client: Client,
    hv: H,
    settle_window: Duration,
    counter: SpecAttachmentCounter,
    events: EventRecorder,
}

impl<H: HypervisorClient> Reconciler<H> {
    pub fn new(client: Client, hv: H, settle_window: Duration) -> Self {
        let events = EventRecorder::new(client.clone(), FIELD_MANAGER);
        Self {
            client,
            hv,
            settle_window,
            counter: SpecAttachmentCounter,
            events,
        }
    }

    pub async fn reconcile(&self, vm: Arc<VirtualMachine>) -> Result<Action, ControllerError> {
        let name = vm.name_any();
        let namespace = vm.namespace().unwrap_or_default();
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);

        // Work against a fresh read, not the watch cache.
        let Some(fresh) = api.get_opt(&name).await? else {
            debug!("VirtualMachine {namespace}/{name} is gone");
            return Ok(Action::await_change());
        };

        let generation = fresh.metadata.generation.unwrap_or_default();
        let uid = fresh.metadata.uid.clone().unwrap_or_default();
        let mut ctx = VmContext {
            vm: ReconciledResource::new(fresh),
            state: VmState::new(self.client.clone(), namespace.clone(), name.clone(), uid),
            events: self.events.clone(),
        };

        // Seed missing conditions as Unknown first and come back: the
        // chain always runs against a fully shaped condition set.
        if add_all_unknown(
            &mut ctx.vm.status_mut().conditions,
            generation,
            ALL_CONDITION_TYPES,
        ) {
            ctx.vm.persist_status(&api, FIELD_MANAGER).await?;
            return Ok(Action::requeue(BOOTSTRAP_REQUEUE));
        }

        let outcome = self.run_chain(&mut ctx).await;

        // The status accumulated before a failure is still worth
        // persisting; the error itself drives the retry.
        if let Err(persist_err) = ctx.vm.persist_status(&api, FIELD_MANAGER).await {
            match outcome {
                Err(chain_err) => {
                    warn!(
                        "VirtualMachine {namespace}/{name}: status persist failed after \
                         handler error ({persist_err})"
                    );
                    return Err(chain_err);
                }
                Ok(_) => return Err(persist_err.into()),
            }
        }

        let requeue = outcome?;
        Ok(match requeue {
            Some(delay) => Action::requeue(delay),
            None => Action::requeue(RESYNC_INTERVAL),
        })
    }

    /// Runs the chain in its fixed order, merging requeue requests.
    async fn run_chain(
        &self,
        ctx: &mut VmContext,
    ) -> Result<Option<Duration>, ControllerError> {
        let mut requeue = None;

        macro_rules! step {
            ($flow:expr) => {
                match $flow {
                    HandlerFlow::Continue { requeue_after } => {
                        requeue = earliest_requeue(requeue, requeue_after);
                    }
                    HandlerFlow::Stop => return Ok(requeue),
                }
            };
        }

        step!(handlers::cleanup::handle(ctx).await?);
        step!(handlers::block_device::handle(ctx, &self.counter).await?);
        step!(handlers::sync_hypervisor::handle(ctx, &self.hv).await?);
        step!(handlers::power_state::handle(ctx, &self.hv).await?);
        step!(handlers::migrating::handle(ctx, &self.hv, self.settle_window).await?);
        step!(handlers::device_attachment::handle(ctx, &self.hv).await?);
        step!(handlers::lifecycle::handle(ctx).await?);

        Ok(requeue)
    }
}
