//! The ordered handler chain of the VirtualMachine reconciler.
//!
//! Handlers run strictly in the order the driver lists them; later
//! handlers read status fields written by earlier ones in the same
//! pass. Every handler is side-effect idempotent: any pass may be
//! retried from scratch after a write conflict.

pub mod block_device;
pub mod cleanup;
pub mod device_attachment;
pub mod lifecycle;
pub mod migrating;
pub mod power_state;
pub mod sync_hypervisor;

mod finalizers;
pub mod machine_builder;
mod migration_volumes;

pub use finalizers::{ensure_finalizer, remove_finalizer};

use kube::ResourceExt;

use crds::VirtualMachine;
use reconciler::ReconciledResource;

use crate::events::EventRecorder;
use crate::state::VmState;

/// Shared mutable context of one reconcile pass.
pub struct VmContext {
    /// The machine, as fetched and as mutated by the chain.
    pub vm: ReconciledResource<VirtualMachine>,

    /// Lazy read cache over related objects.
    pub state: VmState,

    /// Fire-and-forget event sink.
    pub events: EventRecorder,
}

impl VmContext {
    pub fn name(&self) -> String {
        self.vm.current.name_any()
    }

    pub fn namespace(&self) -> String {
        self.vm.current.namespace().unwrap_or_default()
    }

    /// Metadata generation of the object under reconciliation.
    pub fn generation(&self) -> i64 {
        self.vm.current.metadata.generation.unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.vm.current.metadata.deletion_timestamp.is_some()
    }
}
