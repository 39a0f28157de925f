//! RebuildTask CRD
//!
//! One-shot data streaming job that populates a newly joined datacenter from
//! an already ready peer. Executed by the remote task executor in the target
//! datacenter's context.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "multidc.microscaler.io",
    version = "v1alpha1",
    kind = "RebuildTask",
    namespaced,
    derive = "PartialEq",
    status = "RebuildTaskStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RebuildTaskSpec {
    /// Name of the owning DatabaseCluster
    pub cluster_name: String,

    /// Datacenter being populated
    pub datacenter: String,

    /// Datacenter streaming the data
    pub source_datacenter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildTaskStatus {
    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl RebuildTask {
    pub fn is_completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed)
    }

    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.failed && !s.completed)
    }
}

/// Name of the rebuild task for a datacenter
pub fn rebuild_task_name(datacenter: &str) -> String {
    format!("{}-rebuild", datacenter)
}
