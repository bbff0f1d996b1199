//! Shared reconcile-pass plumbing for the VMOps controllers.
//!
//! A reconcile pass runs a fixed chain of handlers over a two-snapshot
//! view of the object (`ReconciledResource`), then persists the status
//! once. Handlers communicate flow control through [`HandlerFlow`].

pub mod bootstrap;
pub mod flow;
pub mod resource;

pub use bootstrap::*;
pub use flow::*;
pub use resource::*;
