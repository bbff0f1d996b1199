//! VirtualMachine Controller
//!
//! Reconciles `VirtualMachine` resources against the lower
//! virtualization layer: block-device readiness, hypervisor machine
//! synchronization with restart-approval handling, run-policy power
//! enforcement, live/volume migration orchestration and hotplug of
//! disks, images and USB devices.

mod controller;
mod error;
mod events;
mod handlers;
mod hypervisor_client;
mod reconciler;
mod shutdown;
mod state;
mod vmchange;

use std::env;
use std::time::Duration;

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

    info!("Starting VirtualMachine Controller");

    // Load configuration from environment variables
    let namespace = env::var("WATCH_NAMESPACE").ok();
    let settle_seconds = match env::var("VOLUME_MIGRATION_SETTLE_SECONDS") {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            ControllerError::Configuration(format!(
                "VOLUME_MIGRATION_SETTLE_SECONDS must be an integer, got {v:?}"
            ))
        })?,
        Err(_) => 5,
    };

    info!("Configuration:");
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Volume migration settle window: {settle_seconds}s");

    let controller = Controller::new(namespace, Duration::from_secs(settle_seconds)).await?;
    controller.run().await
}
