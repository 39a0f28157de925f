//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::config::Settings;
use crate::reconciler::Reconciler;
use crate::reconciler::observe::Observation;
use context_client::{ContextClientTrait, MockContextClient};
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Namespace every test cluster lives in
pub const TEST_NAMESPACE: &str = "db";

/// Secret referenced by the test backup policy
pub const TEST_SECRET: &str = "medusa-secret";

/// Helper to create a datacenter entry of a cluster spec
pub fn datacenter_template(name: &str, context: &str) -> DatacenterTemplate {
    DatacenterTemplate {
        name: name.to_string(),
        k8s_context: context.to_string(),
        size: 3,
        ..Default::default()
    }
}

/// Backup policy using `medusa-secret` for credentials and storage
pub fn backup_policy() -> BackupPolicy {
    BackupPolicy {
        storage_properties: StorageProperties {
            storage_secret_ref: SecretRef {
                name: TEST_SECRET.to_string(),
            },
            ..Default::default()
        },
        credentials_secret_ref: SecretRef {
            name: TEST_SECRET.to_string(),
        },
        ..Default::default()
    }
}

/// Helper to create a DatabaseCluster with a backup policy
pub fn test_cluster(name: &str, datacenters: &[(&str, &str)]) -> DatabaseCluster {
    DatabaseCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: DatabaseClusterSpec {
            datacenters: datacenters
                .iter()
                .map(|(dc, context)| datacenter_template(dc, context))
                .collect(),
            backup: Some(backup_policy()),
        },
        status: None,
    }
}

/// Remote datacenter at generation 2
///
/// * `ready` - Ready condition True, otherwise False
/// * `generation_observed` - observedGeneration caught up with generation
pub fn observed_datacenter(name: &str, ready: bool, generation_observed: bool) -> Observation {
    let mut dc = Datacenter::new(name, DatacenterSpec::default());
    dc.metadata.generation = Some(2);
    dc.status = Some(DatacenterStatus {
        conditions: vec![DatacenterCondition::new(
            CONDITION_READY,
            if ready { ConditionStatus::True } else { ConditionStatus::False },
        )],
        observed_generation: Some(if generation_observed { 2 } else { 1 }),
    });
    Observation::Found(Box::new(dc))
}

/// Reconciler backed by `mock`; both share the same in-memory state
pub fn test_reconciler(mock: &MockContextClient) -> Reconciler {
    let settings = Settings {
        data_plane_contexts: mock.contexts(),
        ..Default::default()
    };
    Reconciler::new(mock.clone(), settings)
}
