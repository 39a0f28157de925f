//! DatabaseCluster CRD
//!
//! Declares a multi-region database cluster: an ordered list of datacenters,
//! each living in its own Kubernetes context, plus an optional backup policy
//! that is attached to every datacenter.

use crate::datacenter::DatacenterCondition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "multidc.microscaler.io",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    namespaced,
    status = "DatabaseClusterStatus",
    shortname = "dbc",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Datacenters in sequencing order
    pub datacenters: Vec<DatacenterTemplate>,

    /// Backup policy attached to every datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterTemplate {
    /// Datacenter name, unique within the cluster
    pub name: String,

    /// Kubernetes context that owns this datacenter
    pub k8s_context: String,

    /// Number of database nodes
    pub size: u32,

    /// Database server version override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,

    /// Storage class for the data volume claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Changing this value re-arms a failed rebuild for this datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Backup container image
    #[serde(default)]
    pub container_image: ContainerImage,

    /// Storage backend settings
    pub storage_properties: StorageProperties,

    /// Secret holding the database credentials used by the backup containers
    pub credentials_secret_ref: SecretRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSettings>,

    /// Resolve peer IP addresses instead of host names (defaults to false)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_ip_addresses: Option<bool>,

    /// Replica count of the standalone backup deployment (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone_replicas: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    #[serde(default = "ContainerImage::default_registry")]
    pub registry: String,

    #[serde(default = "ContainerImage::default_repository")]
    pub repository: String,

    #[serde(default = "ContainerImage::default_name")]
    pub name: String,

    #[serde(default = "ContainerImage::default_tag")]
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl ContainerImage {
    fn default_registry() -> String {
        "docker.io".to_string()
    }

    fn default_repository() -> String {
        "k8ssandra".to_string()
    }

    fn default_name() -> String {
        "medusa".to_string()
    }

    fn default_tag() -> String {
        "latest".to_string()
    }

    /// Full image reference, e.g. `docker.io/k8ssandra/medusa:latest`
    pub fn reference(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.repository, self.name, self.tag)
    }
}

impl Default for ContainerImage {
    fn default() -> Self {
        Self {
            registry: Self::default_registry(),
            repository: Self::default_repository(),
            name: Self::default_name(),
            tag: Self::default_tag(),
            pull_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageProperties {
    /// Storage provider, e.g. `s3`, `gcs`, `local`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Secret holding the storage backend credentials
    pub storage_secret_ref: SecretRef,
}

/// Reference to a Secret in the cluster's namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

/// Container resource limits and requests, as quantity strings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    /// Per-datacenter status, keyed by datacenter name
    #[serde(default)]
    pub datacenters: BTreeMap<String, DatacenterStatusEntry>,

    /// True when every tracked datacenter reports Ready=True
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DatacenterCondition>,

    /// Configuration error that halts progress until the cluster is edited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterStatusEntry {
    /// Context the datacenter was created in
    pub k8s_context: String,

    /// Snapshot of the remote datacenter conditions
    #[serde(default)]
    pub conditions: Vec<DatacenterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Set once the datacenter has reported Ready=True at least once
    #[serde(default)]
    pub ready_once: bool,

    #[serde(default)]
    pub sidecar_injected: bool,

    #[serde(default)]
    pub standalone_backup: StandaloneBackupStatus,

    #[serde(default)]
    pub rebuild: RebuildStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneBackupStatus {
    /// Deployment and service exist in the datacenter's context
    #[serde(default)]
    pub deployed: bool,

    /// Deployment has all desired replicas ready
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStatus {
    pub state: RebuildState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_datacenter: Option<String>,

    /// Name of the RebuildTask in the datacenter's context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// `rebuildToken` the current rebuild cycle was started for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Rebuild lifecycle of a joining datacenter
///
/// Serializes as PascalCase ("NotNeeded", "Pending", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum RebuildState {
    #[default]
    NotNeeded,
    Pending,
    Created,
    Completed,
    Failed,
}

impl DatabaseCluster {
    /// Name with characters that are invalid in DNS labels replaced
    pub fn sanitized_name(&self) -> String {
        sanitize_name(self.metadata.name.as_deref().unwrap_or_default())
    }
}

/// Lowercases and replaces anything outside `[a-z0-9-]` with `-`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_image_reference() {
        assert_eq!(ContainerImage::default().reference(), "docker.io/k8ssandra/medusa:latest");
    }

    #[test]
    fn test_partial_image_uses_defaults() {
        let image: ContainerImage = serde_json::from_str(r#"{"repository":"test"}"#).unwrap();
        assert_eq!(image.reference(), "docker.io/test/medusa:latest");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My_Cluster.1"), "my-cluster-1");
        assert_eq!(sanitize_name("test"), "test");
    }

    #[test]
    fn test_rebuild_state_serializes_pascal_case() {
        let json = serde_json::to_string(&RebuildState::NotNeeded).unwrap();
        assert_eq!(json, "\"NotNeeded\"");
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: DatabaseClusterSpec = serde_json::from_value(serde_json::json!({
            "datacenters": [
                {"name": "dc1", "k8sContext": "east", "size": 3},
                {"name": "dc2", "k8sContext": "west", "size": 3, "rebuildToken": "a"}
            ],
            "backup": {
                "storageProperties": {"storageSecretRef": {"name": "storage-secret"}},
                "credentialsSecretRef": {"name": "medusa-secret"}
            }
        }))
        .unwrap();
        assert_eq!(spec.datacenters[1].k8s_context, "west");
        assert_eq!(spec.datacenters[1].rebuild_token.as_deref(), Some("a"));
        let backup = spec.backup.unwrap();
        assert_eq!(backup.credentials_secret_ref.name, "medusa-secret");
        assert_eq!(backup.container_image, ContainerImage::default());
    }
}
