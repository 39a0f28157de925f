//! ContextClient trait for mocking
//!
//! Abstracts every read and write the cluster controller performs against the
//! control plane and data plane contexts. The kube-backed `KubeContextClient`
//! implements it for production and `MockContextClient` (feature `test-util`)
//! implements it in memory for unit tests.

use crate::error::ContextError;
use crate::key::ClusterKey;
use crds::{DatabaseClusterStatus, Datacenter, RebuildTask};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};

/// Per-kind operations against named contexts.
///
/// `patch_*` operations apply the owned fields of the given object (labels,
/// annotations and spec or data) on top of the live object. All async methods
/// are `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ContextClientTrait: Send + Sync {
    /// Name of the context holding DatabaseCluster objects
    fn control_plane_context(&self) -> &str;

    /// Every configured context, control plane included
    fn contexts(&self) -> Vec<String>;

    // Control plane
    async fn patch_cluster_status(
        &self,
        key: &ClusterKey,
        status: &DatabaseClusterStatus,
    ) -> Result<(), ContextError>;
    async fn set_cluster_finalizers(
        &self,
        key: &ClusterKey,
        finalizers: &[String],
    ) -> Result<(), ContextError>;

    // Datacenters
    async fn get_datacenter(&self, key: &ClusterKey) -> Result<Datacenter, ContextError>;
    async fn create_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError>;
    async fn patch_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError>;
    async fn delete_datacenter(&self, key: &ClusterKey) -> Result<(), ContextError>;

    // Rebuild tasks
    async fn get_rebuild_task(&self, key: &ClusterKey) -> Result<RebuildTask, ContextError>;
    async fn create_rebuild_task(
        &self,
        key: &ClusterKey,
        task: &RebuildTask,
    ) -> Result<RebuildTask, ContextError>;
    async fn delete_rebuild_task(&self, key: &ClusterKey) -> Result<(), ContextError>;

    // Deployments
    async fn get_deployment(&self, key: &ClusterKey) -> Result<Deployment, ContextError>;
    async fn create_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError>;
    async fn patch_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError>;
    async fn delete_deployment(&self, key: &ClusterKey) -> Result<(), ContextError>;

    // Services
    async fn get_service(&self, key: &ClusterKey) -> Result<Service, ContextError>;
    async fn create_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError>;
    async fn patch_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError>;
    async fn delete_service(&self, key: &ClusterKey) -> Result<(), ContextError>;

    // Config maps
    async fn get_config_map(&self, key: &ClusterKey) -> Result<ConfigMap, ContextError>;
    async fn create_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError>;
    async fn patch_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError>;
    async fn delete_config_map(&self, key: &ClusterKey) -> Result<(), ContextError>;

    // Secrets
    async fn get_secret(&self, key: &ClusterKey) -> Result<Secret, ContextError>;
    async fn create_secret(
        &self,
        key: &ClusterKey,
        secret: &Secret,
    ) -> Result<Secret, ContextError>;
    async fn patch_secret(&self, key: &ClusterKey, secret: &Secret) -> Result<Secret, ContextError>;
    async fn delete_secret(&self, key: &ClusterKey) -> Result<(), ContextError>;
}
