//! Mock ContextClient for unit testing
//!
//! In-memory implementation of `ContextClientTrait`. Every context has its own
//! set of stores, writes are journaled so tests can assert on exactly what the
//! controller did, and contexts or individual objects can be made to fail.
//!
//! - `store.rs` - Generic per-kind object store with create/patch/delete semantics

mod store;

use crate::context_trait::ContextClientTrait;
use crate::error::ContextError;
use crate::key::{ClusterKey, ObjectKind};
use crate::patch::status_patch;
use crds::{
    DatabaseCluster, DatabaseClusterStatus, Datacenter, DatacenterStatus, RebuildTask,
    RebuildTaskStatus,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use store::{Store, lock};

/// Kind of write recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Patch,
    Delete,
    StatusPatch,
    FinalizerUpdate,
}

/// One successful write issued through the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub op: WriteOp,
    pub kind: ObjectKind,
    pub key: ClusterKey,
}

/// Mock ContextClient for testing
#[derive(Debug, Clone)]
pub struct MockContextClient {
    control_plane: String,
    contexts: Vec<String>,
    clusters: Store<DatabaseCluster>,
    datacenters: Store<Datacenter>,
    rebuild_tasks: Store<RebuildTask>,
    deployments: Store<Deployment>,
    services: Store<Service>,
    config_maps: Store<ConfigMap>,
    secrets: Store<Secret>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    failing_writes: Arc<Mutex<HashSet<(ObjectKind, ClusterKey)>>>,
    journal: Arc<Mutex<Vec<RecordedWrite>>>,
}

impl MockContextClient {
    /// Create a new mock with a control plane and the given data plane contexts
    pub fn new(control_plane: impl Into<String>, data_plane: &[&str]) -> Self {
        let control_plane = control_plane.into();
        let mut contexts = vec![control_plane.clone()];
        for context in data_plane {
            if !contexts.iter().any(|c| c == context) {
                contexts.push((*context).to_string());
            }
        }
        contexts.sort();

        Self {
            control_plane,
            contexts,
            clusters: Store::new(ObjectKind::DatabaseCluster),
            datacenters: Store::new(ObjectKind::Datacenter),
            rebuild_tasks: Store::new(ObjectKind::RebuildTask),
            deployments: Store::new(ObjectKind::Deployment),
            services: Store::new(ObjectKind::Service),
            config_maps: Store::new(ObjectKind::ConfigMap),
            secrets: Store::new(ObjectKind::Secret),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
            failing_writes: Arc::new(Mutex::new(HashSet::new())),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // Failure injection

    /// Makes every call against `context` fail with a transient error
    pub fn set_unreachable(&self, context: &str, unreachable: bool) {
        let mut set = lock(&self.unreachable);
        if unreachable {
            set.insert(context.to_string());
        } else {
            set.remove(context);
        }
    }

    /// Makes creates, patches and deletes of one object fail until cleared
    pub fn fail_writes(&self, kind: ObjectKind, key: &ClusterKey) {
        lock(&self.failing_writes).insert((kind, key.clone()));
    }

    pub fn clear_failures(&self) {
        lock(&self.unreachable).clear();
        lock(&self.failing_writes).clear();
    }

    // Journal

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.journal).clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.journal).len()
    }

    pub fn clear_writes(&self) {
        lock(&self.journal).clear();
    }

    /// Number of successful `op` writes of `kind`
    pub fn count_writes(&self, op: WriteOp, kind: ObjectKind) -> usize {
        lock(&self.journal)
            .iter()
            .filter(|w| w.op == op && w.kind == kind)
            .count()
    }

    // Seeding and inspection

    pub fn add_cluster(&self, cluster: DatabaseCluster) {
        let key = ClusterKey::new(
            self.control_plane.clone(),
            cluster.metadata.namespace.clone().unwrap_or_default(),
            cluster.metadata.name.clone().unwrap_or_default(),
        );
        self.clusters.seed(&key, cluster);
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<DatabaseCluster> {
        self.clusters.peek(key)
    }

    pub fn insert_datacenter(&self, key: &ClusterKey, datacenter: Datacenter) {
        self.datacenters.seed(key, datacenter);
    }

    pub fn insert_rebuild_task(&self, key: &ClusterKey, task: RebuildTask) {
        self.rebuild_tasks.seed(key, task);
    }

    pub fn insert_secret(&self, key: &ClusterKey, secret: Secret) {
        self.secrets.seed(key, secret);
    }

    pub fn datacenter(&self, key: &ClusterKey) -> Option<Datacenter> {
        self.datacenters.peek(key)
    }

    pub fn rebuild_task(&self, key: &ClusterKey) -> Option<RebuildTask> {
        self.rebuild_tasks.peek(key)
    }

    pub fn deployment(&self, key: &ClusterKey) -> Option<Deployment> {
        self.deployments.peek(key)
    }

    pub fn service(&self, key: &ClusterKey) -> Option<Service> {
        self.services.peek(key)
    }

    pub fn config_map(&self, key: &ClusterKey) -> Option<ConfigMap> {
        self.config_maps.peek(key)
    }

    pub fn secret(&self, key: &ClusterKey) -> Option<Secret> {
        self.secrets.peek(key)
    }

    /// Number of stored objects of `kind` across every context
    pub fn count(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::DatabaseCluster => self.clusters.len(),
            ObjectKind::Datacenter => self.datacenters.len(),
            ObjectKind::RebuildTask => self.rebuild_tasks.len(),
            ObjectKind::Deployment => self.deployments.len(),
            ObjectKind::Service => self.services.len(),
            ObjectKind::ConfigMap => self.config_maps.len(),
            ObjectKind::Secret => self.secrets.len(),
        }
    }

    /// Number of controller-managed objects stored in one context
    pub fn objects_in(&self, context: &str) -> usize {
        self.datacenters.len_in(context)
            + self.rebuild_tasks.len_in(context)
            + self.deployments.len_in(context)
            + self.services.len_in(context)
            + self.config_maps.len_in(context)
            + self.secrets.len_in(context)
    }

    // Simulated remote operators

    /// Sets the status the remote database operator reports
    pub fn set_datacenter_status(&self, key: &ClusterKey, status: DatacenterStatus) -> bool {
        self.datacenters.modify(key, |dc| dc.status = Some(status))
    }

    /// Marks a datacenter Ready with its current generation observed
    pub fn mark_datacenter_ready(&self, key: &ClusterKey) -> bool {
        self.datacenters.modify(key, |dc| {
            let mut ready =
                crds::DatacenterCondition::new(crds::CONDITION_READY, crds::ConditionStatus::True);
            ready.last_transition_time = Some(chrono::Utc::now());
            dc.status = Some(DatacenterStatus {
                conditions: vec![ready],
                observed_generation: dc.metadata.generation,
            });
        })
    }

    /// Sets the status the remote task executor reports
    pub fn set_rebuild_task_status(&self, key: &ClusterKey, status: RebuildTaskStatus) -> bool {
        self.rebuild_tasks.modify(key, |task| task.status = Some(status))
    }

    pub fn set_deployment_ready_replicas(&self, key: &ClusterKey, ready_replicas: i32) -> bool {
        self.deployments.modify(key, |deployment| {
            let status = deployment.status.get_or_insert_with(DeploymentStatus::default);
            status.ready_replicas = Some(ready_replicas);
            status.replicas = Some(ready_replicas);
        })
    }

    fn check_reachable(&self, key: &ClusterKey) -> Result<(), ContextError> {
        if !self.contexts.contains(&key.context) {
            return Err(ContextError::UnknownContext(key.context.clone()));
        }
        if lock(&self.unreachable).contains(&key.context) {
            return Err(ContextError::Transient {
                context: key.context.clone(),
                message: "context unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn check_writable(&self, kind: ObjectKind, key: &ClusterKey) -> Result<(), ContextError> {
        self.check_reachable(key)?;
        if lock(&self.failing_writes).contains(&(kind, key.clone())) {
            return Err(ContextError::Transient {
                context: key.context.clone(),
                message: format!("injected write failure for {} {}", kind, key),
            });
        }
        Ok(())
    }

    fn record(&self, op: WriteOp, kind: ObjectKind, key: &ClusterKey) {
        lock(&self.journal).push(RecordedWrite {
            op,
            kind,
            key: key.clone(),
        });
    }
}

macro_rules! read_op {
    ($self:ident, $store:ident, $key:ident) => {{
        $self.check_reachable($key)?;
        $self.$store.get($key)
    }};
}

macro_rules! write_op {
    ($self:ident, $store:ident, $kind:expr, $op:expr, $key:ident, $call:ident $(, $arg:ident)?) => {{
        $self.check_writable($kind, $key)?;
        let result = $self.$store.$call($key $(, $arg)?)?;
        $self.record($op, $kind, $key);
        Ok(result)
    }};
}

#[async_trait::async_trait]
impl ContextClientTrait for MockContextClient {
    fn control_plane_context(&self) -> &str {
        &self.control_plane
    }

    fn contexts(&self) -> Vec<String> {
        self.contexts.clone()
    }

    async fn patch_cluster_status(
        &self,
        key: &ClusterKey,
        status: &DatabaseClusterStatus,
    ) -> Result<(), ContextError> {
        self.check_writable(ObjectKind::DatabaseCluster, key)?;
        // Same diff the real client sends, applied to the stored object
        let live = self.clusters.get(key)?;
        let patch = status_patch(live.status.as_ref(), status)?;
        let mut value = serde_json::to_value(&live)?;
        json_patch::patch(&mut value, &patch).map_err(|e| ContextError::Transient {
            context: key.context.clone(),
            message: format!("status patch rejected: {}", e),
        })?;
        let patched: DatabaseCluster = serde_json::from_value(value)?;
        self.clusters.modify(key, |cluster| cluster.status = patched.status);
        self.record(WriteOp::StatusPatch, ObjectKind::DatabaseCluster, key);
        Ok(())
    }

    async fn set_cluster_finalizers(
        &self,
        key: &ClusterKey,
        finalizers: &[String],
    ) -> Result<(), ContextError> {
        self.check_writable(ObjectKind::DatabaseCluster, key)?;
        let finalizers = finalizers.to_vec();
        if !self.clusters.modify(key, |cluster| {
            cluster.metadata.finalizers = if finalizers.is_empty() {
                None
            } else {
                Some(finalizers)
            };
        }) {
            return Err(ContextError::NotFound {
                kind: ObjectKind::DatabaseCluster,
                key: key.clone(),
            });
        }
        self.record(WriteOp::FinalizerUpdate, ObjectKind::DatabaseCluster, key);
        Ok(())
    }

    async fn get_datacenter(&self, key: &ClusterKey) -> Result<Datacenter, ContextError> {
        read_op!(self, datacenters, key)
    }
    async fn create_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError> {
        write_op!(
            self,
            datacenters,
            ObjectKind::Datacenter,
            WriteOp::Create,
            key,
            create,
            datacenter
        )
    }
    async fn patch_datacenter(
        &self,
        key: &ClusterKey,
        datacenter: &Datacenter,
    ) -> Result<Datacenter, ContextError> {
        write_op!(self, datacenters, ObjectKind::Datacenter, WriteOp::Patch, key, patch, datacenter)
    }
    async fn delete_datacenter(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, datacenters, ObjectKind::Datacenter, WriteOp::Delete, key, delete)
    }

    async fn get_rebuild_task(&self, key: &ClusterKey) -> Result<RebuildTask, ContextError> {
        read_op!(self, rebuild_tasks, key)
    }
    async fn create_rebuild_task(
        &self,
        key: &ClusterKey,
        task: &RebuildTask,
    ) -> Result<RebuildTask, ContextError> {
        write_op!(self, rebuild_tasks, ObjectKind::RebuildTask, WriteOp::Create, key, create, task)
    }
    async fn delete_rebuild_task(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, rebuild_tasks, ObjectKind::RebuildTask, WriteOp::Delete, key, delete)
    }

    async fn get_deployment(&self, key: &ClusterKey) -> Result<Deployment, ContextError> {
        read_op!(self, deployments, key)
    }
    async fn create_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError> {
        write_op!(
            self,
            deployments,
            ObjectKind::Deployment,
            WriteOp::Create,
            key,
            create,
            deployment
        )
    }
    async fn patch_deployment(
        &self,
        key: &ClusterKey,
        deployment: &Deployment,
    ) -> Result<Deployment, ContextError> {
        write_op!(self, deployments, ObjectKind::Deployment, WriteOp::Patch, key, patch, deployment)
    }
    async fn delete_deployment(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, deployments, ObjectKind::Deployment, WriteOp::Delete, key, delete)
    }

    async fn get_service(&self, key: &ClusterKey) -> Result<Service, ContextError> {
        read_op!(self, services, key)
    }
    async fn create_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError> {
        write_op!(self, services, ObjectKind::Service, WriteOp::Create, key, create, service)
    }
    async fn patch_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<Service, ContextError> {
        write_op!(self, services, ObjectKind::Service, WriteOp::Patch, key, patch, service)
    }
    async fn delete_service(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, services, ObjectKind::Service, WriteOp::Delete, key, delete)
    }

    async fn get_config_map(&self, key: &ClusterKey) -> Result<ConfigMap, ContextError> {
        read_op!(self, config_maps, key)
    }
    async fn create_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError> {
        write_op!(
            self,
            config_maps,
            ObjectKind::ConfigMap,
            WriteOp::Create,
            key,
            create,
            config_map
        )
    }
    async fn patch_config_map(
        &self,
        key: &ClusterKey,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, ContextError> {
        write_op!(self, config_maps, ObjectKind::ConfigMap, WriteOp::Patch, key, patch, config_map)
    }
    async fn delete_config_map(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, config_maps, ObjectKind::ConfigMap, WriteOp::Delete, key, delete)
    }

    async fn get_secret(&self, key: &ClusterKey) -> Result<Secret, ContextError> {
        read_op!(self, secrets, key)
    }
    async fn create_secret(
        &self,
        key: &ClusterKey,
        secret: &Secret,
    ) -> Result<Secret, ContextError> {
        write_op!(self, secrets, ObjectKind::Secret, WriteOp::Create, key, create, secret)
    }
    async fn patch_secret(
        &self,
        key: &ClusterKey,
        secret: &Secret,
    ) -> Result<Secret, ContextError> {
        write_op!(self, secrets, ObjectKind::Secret, WriteOp::Patch, key, patch, secret)
    }
    async fn delete_secret(&self, key: &ClusterKey) -> Result<(), ContextError> {
        write_op!(self, secrets, ObjectKind::Secret, WriteOp::Delete, key, delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::DatacenterSpec;

    fn dc_key() -> ClusterKey {
        ClusterKey::new("east", "db", "dc1")
    }

    fn datacenter(size: u32) -> Datacenter {
        Datacenter::new(
            "dc1",
            DatacenterSpec {
                cluster_name: "test".to_string(),
                size,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_create_sets_generation_and_rejects_duplicates() {
        let mock = MockContextClient::new("control", &["east"]);
        let created = mock.create_datacenter(&dc_key(), &datacenter(3)).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        assert_eq!(created.metadata.namespace.as_deref(), Some("db"));

        let err = mock.create_datacenter(&dc_key(), &datacenter(3)).await.unwrap_err();
        assert!(matches!(err, ContextError::AlreadyExists { .. }));
        assert_eq!(mock.count_writes(WriteOp::Create, ObjectKind::Datacenter), 1);
    }

    #[tokio::test]
    async fn test_patch_bumps_generation_only_on_spec_change() {
        let mock = MockContextClient::new("control", &["east"]);
        mock.create_datacenter(&dc_key(), &datacenter(3)).await.unwrap();
        mock.mark_datacenter_ready(&dc_key());

        let same = mock.patch_datacenter(&dc_key(), &datacenter(3)).await.unwrap();
        assert_eq!(same.metadata.generation, Some(1));
        assert!(same.status.is_some(), "patch must not clobber remote status");

        let grown = mock.patch_datacenter(&dc_key(), &datacenter(5)).await.unwrap();
        assert_eq!(grown.metadata.generation, Some(2));
        assert_eq!(grown.spec.size, 5);
    }

    #[tokio::test]
    async fn test_unreachable_context_is_transient() {
        let mock = MockContextClient::new("control", &["east"]);
        mock.set_unreachable("east", true);
        let err = mock.get_datacenter(&dc_key()).await.unwrap_err();
        assert!(err.is_transient());

        mock.set_unreachable("east", false);
        assert!(mock.get_datacenter(&dc_key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_context() {
        let mock = MockContextClient::new("control", &["east"]);
        let key = ClusterKey::new("west", "db", "dc1");
        let err = mock.get_datacenter(&key).await.unwrap_err();
        assert!(matches!(err, ContextError::UnknownContext(_)));
    }

    #[tokio::test]
    async fn test_failed_writes_are_not_journaled() {
        let mock = MockContextClient::new("control", &["east"]);
        mock.fail_writes(ObjectKind::Datacenter, &dc_key());
        assert!(mock.create_datacenter(&dc_key(), &datacenter(3)).await.is_err());
        assert_eq!(mock.write_count(), 0);
        assert_eq!(mock.count(ObjectKind::Datacenter), 0);
    }

    #[tokio::test]
    async fn test_status_patch_clears_removed_fields() {
        let mock = MockContextClient::new("control", &["east"]);
        let mut cluster = DatabaseCluster::new("test", crds::DatabaseClusterSpec::default());
        cluster.metadata.namespace = Some("db".to_string());
        mock.add_cluster(cluster);
        let key = ClusterKey::new("control", "db", "test");

        let mut status = DatabaseClusterStatus {
            error: Some("boom".to_string()),
            ..Default::default()
        };
        status.datacenters.insert("dc1".to_string(), Default::default());
        status.datacenters.insert("dc2".to_string(), Default::default());
        mock.patch_cluster_status(&key, &status).await.unwrap();

        status.datacenters.remove("dc2");
        status.error = None;
        mock.patch_cluster_status(&key, &status).await.unwrap();

        assert_eq!(mock.cluster(&key).and_then(|c| c.status), Some(status));
        assert_eq!(mock.count_writes(WriteOp::StatusPatch, ObjectKind::DatabaseCluster), 2);
    }
}
