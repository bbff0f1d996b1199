//! VMOps CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VMOps controllers.
//!
//! Two API groups are defined here:
//! - `vmops.io/v1alpha1`: the user-facing virtualization resources
//! - `hypervisor.vmops.io/v1alpha1`: the lower virtualization layer the
//!   VM controller drives (desired machine, live instance, migration)

pub mod attachment;
pub mod block_device;
pub mod conditions;
pub mod hypervisor;
pub mod ip_address;
pub mod operation;
pub mod usb_device;
pub mod virtual_machine;
pub mod vm_class;

pub use attachment::*;
pub use block_device::*;
pub use conditions::*;
pub use hypervisor::*;
pub use ip_address::*;
pub use operation::*;
pub use usb_device::*;
pub use virtual_machine::*;
pub use vm_class::*;

/// API group of the user-facing resources.
pub const API_GROUP: &str = "vmops.io";

/// API group of the hypervisor-layer resources.
pub const HYPERVISOR_API_GROUP: &str = "hypervisor.vmops.io";
