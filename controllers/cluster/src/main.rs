//! Multi-DC Cluster Controller
//!
//! Reconciles `DatabaseCluster` objects into datacenters spread over several
//! Kubernetes contexts:
//! - Datacenters are created one at a time, each after its predecessors are Ready
//! - Backup sidecars are injected into every datacenter's pod template
//! - Joining datacenters stream their data from a ready peer via a RebuildTask
//! - Per-datacenter progress is folded into the cluster status

mod backoff;
mod config;
mod controller;
mod error;
mod reconcile_helpers;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Settings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Multi-DC Cluster Controller");

    let settings = Settings::from_env()?;

    info!("Configuration:");
    info!(
        "  Control plane: {}",
        settings.control_plane_context.as_deref().unwrap_or("in-cluster")
    );
    info!("  Data plane contexts: {}", settings.data_plane_contexts.join(", "));
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Requeue while waiting: {:?}", settings.requeue_waiting);
    info!(
        "  Backoff: {}s..{}s, concurrency {}",
        settings.backoff_min_seconds, settings.backoff_max_seconds, settings.concurrency
    );

    let controller = Controller::new(settings).await?;
    controller.run().await?;

    Ok(())
}
