//! Kube-backed multi-context client
//!
//! Holds one `kube::Client` per configured kubeconfig context. The control
//! plane either comes from a named context or from the in-cluster
//! configuration when no context is given.

use crate::context_trait::ContextClientTrait;
use crate::error::ContextError;
use crate::key::{ClusterKey, ObjectKind};
use crate::patch::{owned_fields_patch, status_patch};
use crds::{DatabaseCluster, DatabaseClusterStatus, Datacenter, RebuildTask};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Context name used for the control plane when running in-cluster
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "multidc-cluster-controller";

/// Multi-context client backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeContextClient {
    control_plane: String,
    clients: HashMap<String, Client>,
}

impl std::fmt::Debug for KubeContextClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut contexts: Vec<_> = self.clients.keys().collect();
        contexts.sort();
        f.debug_struct("KubeContextClient")
            .field("control_plane", &self.control_plane)
            .field("contexts", &contexts)
            .finish()
    }
}

impl KubeContextClient {
    /// Connects to the control plane and every data plane context
    ///
    /// # Arguments
    ///
    /// * `kubeconfig` - Explicit kubeconfig path, falls back to `$KUBECONFIG` / `~/.kube/config`
    /// * `control_plane` - Context holding DatabaseCluster objects, in-cluster config when `None`
    /// * `data_plane` - Contexts datacenters may be placed in
    pub async fn connect(
        kubeconfig: Option<&Path>,
        control_plane: Option<&str>,
        data_plane: &[String],
    ) -> Result<Self, ContextError> {
        let mut clients = HashMap::new();

        let needs_kubeconfig = control_plane.is_some() || !data_plane.is_empty();
        let kubeconfig = if needs_kubeconfig {
            Some(load_kubeconfig(kubeconfig)?)
        } else {
            None
        };

        let control_plane_name = match (control_plane, kubeconfig.as_ref()) {
            (Some(context), Some(kc)) => {
                clients.insert(context.to_string(), client_for_context(kc, context).await?);
                context.to_string()
            }
            _ => {
                let config = Config::infer()
                    .await
                    .map_err(|e| ContextError::Config(format!("in-cluster configuration: {}", e)))?;
                clients.insert(
                    IN_CLUSTER_CONTEXT.to_string(),
                    build_client(config, IN_CLUSTER_CONTEXT)?,
                );
                IN_CLUSTER_CONTEXT.to_string()
            }
        };

        if let Some(kc) = kubeconfig.as_ref() {
            for context in data_plane {
                if clients.contains_key(context) {
                    continue;
                }
                clients.insert(context.clone(), client_for_context(kc, context).await?);
            }
        }

        info!(
            "Connected to {} context(s), control plane: {}",
            clients.len(),
            control_plane_name
        );

        Ok(Self {
            control_plane: control_plane_name,
            clients,
        })
    }

    /// Raw client for a context, used to set up watches
    pub fn client(&self, context: &str) -> Result<Client, ContextError> {
        self.clients
            .get(context)
            .cloned()
            .ok_or_else(|| ContextError::UnknownContext(context.to_string()))
    }

    fn api<K>(&self, key: &ClusterKey) -> Result<Api<K>, ContextError>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Ok(Api::namespaced(self.client(&key.context)?, &key.namespace))
    }

    async fn get<K>(&self, kind: ObjectKind, key: &ClusterKey) -> Result<K, ContextError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(key)?
            .get(&key.name)
            .await
            .map_err(|e| ContextError::from_kube(e, kind, key))
    }

    async fn create<K>(
        &self,
        kind: ObjectKind,
        key: &ClusterKey,
        object: &K,
    ) -> Result<K, ContextError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self
            .api::<K>(key)?
            .create(&pp, object)
            .await
            .map_err(|e| ContextError::from_kube(e, kind, key))?;
        debug!("Created {} {}", kind, key);
        Ok(created)
    }

    async fn patch<K>(
        &self,
        kind: ObjectKind,
        key: &ClusterKey,
        object: &K,
    ) -> Result<K, ContextError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let patch = owned_fields_patch(object)?;
        let patched = self
            .api::<K>(key)?
            .patch(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ContextError::from_kube(e, kind, key))?;
        debug!("Patched {} {}", kind, key);
        Ok(patched)
    }

    async fn delete<K>(&self, kind: ObjectKind, key: &ClusterKey) -> Result<(), ContextError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(key)?
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| ContextError::from_kube(e, kind, key))?;
        debug!("Deleted {} {}", kind, key);
        Ok(())
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn load_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig, ContextError> {
    match path {
        Some(p) => Kubeconfig::read_from(p)
            .map_err(|e| ContextError::Config(format!("reading {}: {}", p.display(), e))),
        None => Kubeconfig::read().map_err(|e| ContextError::Config(e.to_string())),
    }
}

async fn client_for_context(
    kubeconfig: &Kubeconfig,
    context: &str,
) -> Result<Client, ContextError> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
        .await
        .map_err(|e| ContextError::Config(format!("context {}: {}", context, e)))?;
    build_client(config, context)
}

fn build_client(mut config: Config, context: &str) -> Result<Client, ContextError> {
    // Unreachable contexts must fail fast instead of stalling a whole pass
    config.connect_timeout = Some(Duration::from_secs(10));
    config.read_timeout = Some(Duration::from_secs(30));
    Client::try_from(config)
        .map_err(|e| ContextError::Config(format!("context {}: {}", context, e)))
}

#[async_trait::async_trait]
impl ContextClientTrait for KubeContextClient {
    fn control_plane_context(&self) -> &str {
        &self.control_plane
    }

    fn contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.clients.keys().cloned().collect();
        contexts.sort();
        contexts
    }

    async fn patch_cluster_status(
        &self,
        key: &ClusterKey,
        status: &DatabaseClusterStatus,
    ) -> Result<(), ContextError> {
        // Diff against the live status so dropped datacenters and cleared errors are nulled out
        let api = self.api::<DatabaseCluster>(key)?;
        let live = api
            .get_status(&key.name)
            .await
            .map_err(|e| ContextError::from_kube(e, ObjectKind::DatabaseCluster, key))?;
        let patch = status_patch(live.status.as_ref(), status)?;
        if patch.0.is_empty() {
            return Ok(());
        }
        api.patch_status(&key.name, &patch_params(), &Patch::Json::<()>(patch))
            .await
            .map_err(|e| ContextError::from_kube(e, ObjectKind::DatabaseCluster, key))?;
        debug!("Updated status of DatabaseCluster {}", key);
        Ok(())
    }

    async fn set_cluster_finalizers(
        &self,
        key: &ClusterKey,
        finalizers: &[String],
    ) -> Result<(), ContextError> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.api::<DatabaseCluster>(key)?
            .patch(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ContextError::from_kube(e, ObjectKind::DatabaseCluster, key))?;
        Ok(())
    }

    async fn get_datacenter(&self, key: &ClusterKey) -> Result<Datacenter, ContextError> {
        self.get(ObjectKind::Datacenter, key).await
    }
    async fn create_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError> {
        self.create(ObjectKind::Datacenter, key, datacenter).await
    }
    async fn patch_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError> {
        self.patch(ObjectKind::Datacenter, key, datacenter).await
    }
    async fn delete_datacenter(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<Datacenter>(ObjectKind::Datacenter, key).await
    }

    async fn get_rebuild_task(&self, key: &ClusterKey) -> Result<RebuildTask, ContextError> {
        self.get(ObjectKind::RebuildTask, key).await
    }
    async fn create_rebuild_task(
        &self,
        key: &ClusterKey,
        task: &RebuildTask,
    ) -> Result<RebuildTask, ContextError> {
        self.create(ObjectKind::RebuildTask, key, task).await
    }
    async fn delete_rebuild_task(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<RebuildTask>(ObjectKind::RebuildTask, key).await
    }

    async fn get_deployment(&self, key: &ClusterKey) -> Result<Deployment, ContextError> {
        self.get(ObjectKind::Deployment, key).await
    }
    async fn create_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError> {
        self.create(ObjectKind::Deployment, key, deployment).await
    }
    async fn patch_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError> {
        self.patch(ObjectKind::Deployment, key, deployment).await
    }
    async fn delete_deployment(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<Deployment>(ObjectKind::Deployment, key).await
    }

    async fn get_service(&self, key: &ClusterKey) -> Result<Service, ContextError> {
        self.get(ObjectKind::Service, key).await
    }
    async fn create_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError> {
        self.create(ObjectKind::Service, key, service).await
    }
    async fn patch_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError> {
        self.patch(ObjectKind::Service, key, service).await
    }
    async fn delete_service(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<Service>(ObjectKind::Service, key).await
    }

    async fn get_config_map(&self, key: &ClusterKey) -> Result<ConfigMap, ContextError> {
        self.get(ObjectKind::ConfigMap, key).await
    }
    async fn create_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError> {
        self.create(ObjectKind::ConfigMap, key, config_map).await
    }
    async fn patch_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError> {
        self.patch(ObjectKind::ConfigMap, key, config_map).await
    }
    async fn delete_config_map(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<ConfigMap>(ObjectKind::ConfigMap, key).await
    }

    async fn get_secret(&self, key: &ClusterKey) -> Result<Secret, ContextError> {
        self.get(ObjectKind::Secret, key).await
    }
    async fn create_secret(
        &self,
        key: &ClusterKey,
        secret: &Secret,
    ) -> Result<Secret, ContextError> {
        self.create(ObjectKind::Secret, key, secret).await
    }
    async fn patch_secret(
        &self,
        key: &ClusterKey,
        secret: &Secret,
    ) -> Result<Secret, ContextError> {
        self.patch(ObjectKind::Secret, key, secret).await
    }
    async fn delete_secret(&self, key: &ClusterKey) -> Result<(), ContextError> {
        self.delete::<Secret>(ObjectKind::Secret, key).await
    }
}
