//! Datacenter CRD
//!
//! One regional instance of the database, created by the cluster controller
//! in the datacenter's own context and converged by the per-datacenter
//! lifecycle operator, which reports progress through `status.conditions`.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported once every node of the datacenter is up
pub const CONDITION_READY: &str = "Ready";
/// Condition type reported while nodes are being added
pub const CONDITION_SCALING_UP: &str = "ScalingUp";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "multidc.microscaler.io",
    version = "v1alpha1",
    kind = "Datacenter",
    namespaced,
    derive = "PartialEq",
    status = "DatacenterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterSpec {
    /// Name of the owning DatabaseCluster
    pub cluster_name: String,

    /// Number of database nodes
    pub size: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Pod template merged into the database pods by the lifecycle operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub pod_template: Option<PodTemplateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterStatus {
    #[serde(default)]
    pub conditions: Vec<DatacenterCondition>,

    /// Last `metadata.generation` processed by the lifecycle operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatacenterCondition {
    pub fn new(type_: &str, status: ConditionStatus) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }
}

/// Tri-state condition value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Looks up a condition by type
pub fn find_condition<'a>(
    conditions: &'a [DatacenterCondition],
    type_: &str,
) -> Option<&'a DatacenterCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

impl Datacenter {
    /// Status of the Ready condition, `Unknown` when absent
    pub fn ready_status(&self) -> ConditionStatus {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, CONDITION_READY))
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Whether the lifecycle operator has processed the latest spec revision
    pub fn generation_observed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        match (self.metadata.generation, observed) {
            (Some(generation), Some(observed)) => observed >= generation,
            // Servers that do not track generations never report stale status
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datacenter(generation: Option<i64>, status: Option<DatacenterStatus>) -> Datacenter {
        let mut dc = Datacenter::new("dc1", DatacenterSpec::default());
        dc.metadata.generation = generation;
        dc.status = status;
        dc
    }

    #[test]
    fn test_ready_status_unknown_without_status() {
        assert_eq!(datacenter(Some(1), None).ready_status(), ConditionStatus::Unknown);
    }

    #[test]
    fn test_ready_status_reads_condition() {
        let status = DatacenterStatus {
            conditions: vec![
                DatacenterCondition::new(CONDITION_SCALING_UP, ConditionStatus::False),
                DatacenterCondition::new(CONDITION_READY, ConditionStatus::True),
            ],
            observed_generation: Some(1),
        };
        assert_eq!(datacenter(Some(1), Some(status)).ready_status(), ConditionStatus::True);
    }

    #[test]
    fn test_generation_observed() {
        let status = |observed| DatacenterStatus {
            conditions: vec![],
            observed_generation: observed,
        };
        assert!(datacenter(Some(2), Some(status(Some(2)))).generation_observed());
        assert!(datacenter(Some(2), Some(status(Some(3)))).generation_observed());
        assert!(!datacenter(Some(2), Some(status(Some(1)))).generation_observed());
        assert!(!datacenter(Some(2), Some(status(None))).generation_observed());
        assert!(datacenter(None, None).generation_observed());
    }

    #[test]
    fn test_condition_wire_format() {
        let condition = DatacenterCondition::new(CONDITION_READY, ConditionStatus::True);
        let json = serde_json::to_value(condition).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Ready", "status": "True"}));
    }
}
