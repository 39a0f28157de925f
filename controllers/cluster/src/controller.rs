//! Main controller implementation.
//!
//! Connects to every configured context, builds the reconciler and runs the
//! DatabaseCluster watcher in a background task.

use crate::config::Settings;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use context_client::{ContextClientTrait, KubeContextClient};
use crds::DatabaseCluster;
use kube::Api;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for multi-DC database clusters.
#[derive(Debug)]
pub struct Controller {
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Create a new controller instance
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        let client = KubeContextClient::connect(
            settings.kubeconfig.as_deref(),
            settings.control_plane_context.as_deref(),
            &settings.data_plane_contexts,
        )
        .await?;

        let control_plane = client.client(client.control_plane_context())?;
        let clusters: Api<DatabaseCluster> = match settings.namespace.as_deref() {
            Some(ns) => Api::namespaced(control_plane, ns),
            None => Api::all(control_plane),
        };

        let mut data_plane = Vec::with_capacity(settings.data_plane_contexts.len());
        for context in &settings.data_plane_contexts {
            data_plane.push((context.clone(), client.client(context)?));
        }

        let namespace = settings.namespace.clone();
        let reconciler = Arc::new(Reconciler::new(client, settings));
        let watcher = Watcher::new(reconciler, clusters, data_plane, namespace);

        let cluster_watcher = tokio::spawn(async move { watcher.watch_clusters().await });

        Ok(Self { cluster_watcher })
    }

    /// Run the controller until the watcher exits
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("🚀 Multi-DC Cluster Controller running");

        self.cluster_watcher
            .await
            .map_err(|e| {
                ControllerError::Watch(format!("DatabaseCluster watcher panicked: {}", e))
            })?
            .map_err(|e| ControllerError::Watch(format!("DatabaseCluster watcher error: {}", e)))
    }
}
