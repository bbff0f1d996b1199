//! Handler flow control.

use std::time::Duration;

/// Outcome of one handler in a reconcile chain.
///
/// A handler either lets the chain continue (optionally asking for a
/// requeue once the pass ends) or stops the chain outright. Errors are
/// carried separately in the handler's `Result`, so a pass has exactly
/// three outcomes: continue, stop, fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    /// Run the remaining handlers.
    Continue {
        /// Requeue the object after this delay once the pass ends.
        requeue_after: Option<Duration>,
    },

    /// Skip the remaining handlers. The status accumulated so far is
    /// still persisted.
    Stop,
}

impl HandlerFlow {
    /// Continue with no requeue request.
    pub fn proceed() -> Self {
        HandlerFlow::Continue { requeue_after: None }
    }

    /// Continue and ask for a requeue after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        HandlerFlow::Continue {
            requeue_after: Some(delay),
        }
    }
}

/// Merges two requeue requests, keeping the earlier one.
pub fn earliest_requeue(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, y) => y,
    }
}

#[cfg(test)]
#[path = "flow_test.rs"]
mod flow_test;
