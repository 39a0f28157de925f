//! Deletion cascade
//!
//! Runs instead of the forward steps once a cluster is marked for deletion.
//! Removal follows reverse dependency order:
//! 1. per datacenter: rebuild task, standalone backup deployment and service
//! 2. the datacenter itself, once its dependents are gone
//! 3. backup config maps and replicated secrets, once every datacenter is gone
//! 4. the cleanup finalizer
//!
//! Every step is idempotent; a missing object counts as deleted. Anything that
//! fails is retried on the next pass.

use super::Reconciler;
use super::backup::{
    config_map_name, required_secret_names, standalone_deployment_name, standalone_service_name,
};
use crate::error::ControllerError;
use context_client::{ClusterKey, ContextClientTrait, ContextError};
use crds::{CLEANUP_FINALIZER, DatabaseCluster, owning_cluster, rebuild_task_name};
use futures::future::join_all;
use tracing::{debug, info, warn};

/// Progress of the cascade after one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Everything is gone and the finalizer was released
    Done,
    InProgress,
}

fn absent_ok(result: Result<(), ContextError>) -> Result<(), ContextError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Every (datacenter, context) the cluster may own: spec plus status-tracked
pub fn owned_datacenters(cluster: &DatabaseCluster) -> Vec<(String, String)> {
    let mut owned: Vec<(String, String)> = cluster
        .spec
        .datacenters
        .iter()
        .map(|t| (t.name.clone(), t.k8s_context.clone()))
        .collect();
    if let Some(status) = &cluster.status {
        for (name, entry) in &status.datacenters {
            let pair = (name.clone(), entry.k8s_context.clone());
            if !entry.k8s_context.is_empty() && !owned.contains(&pair) {
                owned.push(pair);
            }
        }
    }
    owned
}

impl Reconciler {
    pub(crate) async fn cleanup_cluster(
        &self,
        cluster: &DatabaseCluster,
        name: &str,
        namespace: &str,
    ) -> Result<Cleanup, ControllerError> {
        let owned = owned_datacenters(cluster);
        info!("Cleaning up {} datacenter(s) of {}/{}", owned.len(), namespace, name);

        let removals = owned
            .iter()
            .map(|(dc, context)| self.remove_datacenter(name, namespace, dc, context));
        let all_gone = join_all(removals).await.into_iter().all(|gone| gone);
        if !all_gone {
            return Ok(Cleanup::InProgress);
        }

        let mut contexts: Vec<&str> = owned.iter().map(|(_, c)| c.as_str()).collect();
        contexts.sort_unstable();
        contexts.dedup();
        if !self.remove_shared_objects(cluster, name, namespace, &contexts).await {
            return Ok(Cleanup::InProgress);
        }

        let key = ClusterKey::new(self.client.control_plane_context(), namespace, name);
        let finalizers: Vec<String> = cluster
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        match self.client.set_cluster_finalizers(&key, &finalizers).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!("Cleanup of {}/{} complete, finalizer removed", namespace, name);
        Ok(Cleanup::Done)
    }

    /// Removes one datacenter and its dependents; true once it is gone
    async fn remove_datacenter(
        &self,
        cluster: &str,
        namespace: &str,
        dc: &str,
        context: &str,
    ) -> bool {
        let base = ClusterKey::new(context, namespace, "");
        let task_key = base.with_name(rebuild_task_name(dc));
        let deploy_key = base.with_name(standalone_deployment_name(cluster, dc));
        let svc_key = base.with_name(standalone_service_name(cluster, dc));

        let dependents = [
            absent_ok(self.client.delete_rebuild_task(&task_key).await),
            absent_ok(self.client.delete_deployment(&deploy_key).await),
            absent_ok(self.client.delete_service(&svc_key).await),
        ];
        if let Some(Err(e)) = dependents.into_iter().find(Result::is_err) {
            warn!("Failed to remove dependents of datacenter {} in {}: {}", dc, context, e);
            return false;
        }

        let dc_key = base.with_name(dc);
        if let Err(e) = absent_ok(self.client.delete_datacenter(&dc_key).await) {
            warn!("Failed to delete datacenter {}: {}", dc_key, e);
            return false;
        }
        // The lifecycle operator may hold the object until its own teardown finishes
        match self.client.get_datacenter(&dc_key).await {
            Err(e) if e.is_not_found() => {
                debug!("Datacenter {} is gone", dc_key);
                true
            }
            Ok(_) => {
                info!("Datacenter {} is still terminating", dc_key);
                false
            }
            Err(e) => {
                warn!("Could not confirm deletion of {}: {}", dc_key, e);
                false
            }
        }
    }

    /// Removes config maps and replicated secrets; true once all are gone
    async fn remove_shared_objects(
        &self,
        cluster: &DatabaseCluster,
        name: &str,
        namespace: &str,
        contexts: &[&str],
    ) -> bool {
        let control_plane = self.client.control_plane_context().to_string();
        let secret_names: Vec<String> = cluster
            .spec
            .backup
            .as_ref()
            .map(required_secret_names)
            .unwrap_or_default();
        let owner = Some((namespace.to_string(), name.to_string()));

        let mut done = true;
        for context in contexts {
            let cm_key = ClusterKey::new(*context, namespace, config_map_name(name));
            if let Err(e) = absent_ok(self.client.delete_config_map(&cm_key).await) {
                warn!("Failed to delete config map {}: {}", cm_key, e);
                done = false;
            }

            // Source secrets in the control plane are never touched
            if *context == control_plane {
                continue;
            }
            for secret in &secret_names {
                let key = ClusterKey::new(*context, namespace, secret);
                let result = match self.client.get_secret(&key).await {
                    Ok(found) if owning_cluster(found.metadata.labels.as_ref()) == owner => {
                        absent_ok(self.client.delete_secret(&key).await)
                    }
                    Ok(_) => {
                        debug!("Secret {} is not owned by {}/{}, leaving it", key, namespace, name);
                        Ok(())
                    }
                    Err(e) => absent_ok(Err(e)),
                };
                if let Err(e) = result {
                    warn!("Failed to delete replicated secret {}: {}", key, e);
                    done = false;
                }
            }
        }
        done
    }
}
