//! Kubernetes resource watchers.
//!
//! DatabaseCluster objects are watched in the control plane. Datacenters,
//! rebuild tasks and standalone backup deployments are watched in every data
//! plane context and mapped back to their owning cluster through the
//! `cluster-name` / `cluster-namespace` labels, so remote progress triggers
//! a pass without waiting for the requeue interval.

use crate::error::ControllerError;
use crate::reconciler::{PassOutcome, Reconciler};
use crds::{
    DatabaseCluster, Datacenter, MANAGED_BY_LABEL, MANAGED_BY_VALUE, RebuildTask, owning_cluster,
};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client, Resource};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, controller::{Action, Config as ControllerConfig}, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Waits after the last event before reconciling, batching bursts of
/// remote status updates into one pass
const DEBOUNCE: Duration = Duration::from_secs(2);

/// Backoff key of a cluster
pub fn resource_key(cluster: &DatabaseCluster) -> String {
    format!(
        "{}/{}",
        cluster.metadata.namespace.as_deref().unwrap_or_default(),
        cluster.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Maps a remote object to the cluster that owns it
fn cluster_ref_for<K: Resource>(object: K) -> Option<ObjectRef<DatabaseCluster>> {
    let (namespace, name) = owning_cluster(object.meta().labels.as_ref())?;
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Translates a finished pass into the next controller action
///
/// Backoff state is reset on every outcome except `Retry`.
pub fn next_action(reconciler: &Reconciler, key: &str, outcome: PassOutcome) -> Action {
    match outcome {
        PassOutcome::Converged | PassOutcome::Blocked | PassOutcome::Deleted => {
            reconciler.reset_error(key);
            Action::await_change()
        }
        PassOutcome::Waiting => {
            reconciler.reset_error(key);
            Action::requeue(reconciler.settings.requeue_waiting)
        }
        PassOutcome::Retry => {
            reconciler.increment_error(key);
            let (backoff, error_count) = reconciler.get_backoff_for_resource(key);
            warn!(
                "DatabaseCluster {} had transient failures (count: {}), retrying in {:?}",
                key, error_count, backoff
            );
            Action::requeue(backoff)
        }
    }
}

async fn reconcile(
    cluster: Arc<DatabaseCluster>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, ControllerError> {
    let key = resource_key(&cluster);
    debug!("Reconciling DatabaseCluster {}", key);
    let outcome = reconciler.reconcile_cluster(&cluster).await?;
    Ok(next_action(&reconciler, &key, outcome))
}

fn error_policy(
    cluster: Arc<DatabaseCluster>,
    error: &ControllerError,
    reconciler: Arc<Reconciler>,
) -> Action {
    let key = resource_key(&cluster);
    reconciler.increment_error(&key);
    let (backoff, error_count) = reconciler.get_backoff_for_resource(&key);
    if error.is_transient() {
        warn!(
            "Reconciliation of DatabaseCluster {} failed (count: {}): {}, retrying in {:?}",
            key, error_count, error, backoff
        );
    } else {
        error!(
            "Reconciliation of DatabaseCluster {} failed (count: {}): {}, retrying in {:?}",
            key, error_count, error, backoff
        );
    }
    Action::requeue(backoff)
}

/// Watches DatabaseClusters and the objects they own in remote contexts.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    clusters: Api<DatabaseCluster>,
    /// (context name, client) of every data plane context
    data_plane: Vec<(String, Client)>,
    namespace: Option<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("data_plane", &self.data_plane.iter().map(|(c, _)| c).collect::<Vec<_>>())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        clusters: Api<DatabaseCluster>,
        data_plane: Vec<(String, Client)>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            reconciler,
            clusters,
            data_plane,
            namespace,
        }
    }

    fn remote_api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    /// Runs the DatabaseCluster controller until its stream ends
    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        info!("Starting DatabaseCluster watcher");

        let owned_selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let owned = watcher::Config::default().labels(&owned_selector);
        let mut controller = Controller::new(self.clusters.clone(), watcher::Config::default());
        for (context, client) in &self.data_plane {
            info!("Watching owned objects in context {}", context);
            controller = controller
                .watches(self.remote_api::<Datacenter>(client), owned.clone(), cluster_ref_for)
                .watches(self.remote_api::<RebuildTask>(client), owned.clone(), cluster_ref_for)
                .watches(self.remote_api::<Deployment>(client), owned.clone(), cluster_ref_for);
        }

        let controller_config = ControllerConfig::default()
            .debounce(DEBOUNCE)
            .concurrency(self.reconciler.settings.concurrency);

        controller
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled DatabaseCluster {}", obj),
                    Err(e) => error!("DatabaseCluster controller error: {}", e),
                }
            })
            .await;

        Err(ControllerError::Watch("DatabaseCluster controller stream ended".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_cluster, test_reconciler};
    use context_client::MockContextClient;
    use crds::{DatacenterSpec, datacenter_labels};

    #[test]
    fn test_cluster_ref_from_labels() {
        let mut dc = Datacenter::new("dc1", DatacenterSpec::default());
        dc.metadata.labels = Some(datacenter_labels("test", "db", "dc1"));
        assert_eq!(cluster_ref_for(dc), Some(ObjectRef::new("test").within("db")));
    }

    #[test]
    fn test_unlabelled_objects_are_ignored() {
        let dc = Datacenter::new("dc1", DatacenterSpec::default());
        assert_eq!(cluster_ref_for(dc), None);
    }

    #[test]
    fn test_resource_key() {
        assert_eq!(resource_key(&test_cluster("test", &[])), "db/test");
    }

    #[test]
    fn test_next_action_per_outcome() {
        let mock = MockContextClient::new("control", &["east"]);
        let reconciler = test_reconciler(&mock);

        assert_eq!(
            next_action(&reconciler, "db/test", PassOutcome::Converged),
            Action::await_change()
        );
        assert_eq!(
            next_action(&reconciler, "db/test", PassOutcome::Blocked),
            Action::await_change()
        );
        assert_eq!(
            next_action(&reconciler, "db/test", PassOutcome::Waiting),
            Action::requeue(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_retry_backs_off_and_resets() {
        let mock = MockContextClient::new("control", &["east"]);
        let reconciler = test_reconciler(&mock);

        let delays: Vec<Action> = (0..4)
            .map(|_| next_action(&reconciler, "db/test", PassOutcome::Retry))
            .collect();
        assert_eq!(
            delays,
            [5, 5, 10, 15].map(|s| Action::requeue(Duration::from_secs(s))).to_vec()
        );

        next_action(&reconciler, "db/test", PassOutcome::Converged);
        assert_eq!(
            next_action(&reconciler, "db/test", PassOutcome::Retry),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
