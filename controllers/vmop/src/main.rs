//! VirtualMachineOperation Controller
//!
//! Drives imperative requests against VirtualMachines: start, stop,
//! restart, live migration and eviction. Runs the request phase
//! machine with admission checks, mirrors lower-level migration
//! progress, and creates eviction requests for instances the
//! hypervisor wants off their node.

mod controller;
mod error;
mod evacuation;
mod reconciler;

use std::env;

use tracing::info;

use crate::controller::Controller;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting VirtualMachineOperation Controller");

    // Load configuration from environment variables
    let namespace = env::var("WATCH_NAMESPACE").ok();
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );

    let controller = Controller::new(namespace).await?;
    controller.run().await
}
