//! Desired remote Datacenter objects and spec validation

use super::backup::{has_backup_sidecars, inject_backup_sidecars};
use crate::reconcile_helpers::metadata_drifted;
use crds::{
    BackupPolicy, DatabaseCluster, Datacenter, DatacenterSpec, DatacenterTemplate,
    REBUILD_COMPLETED_ANNOTATION, datacenter_labels,
};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Why a cluster definition can never converge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("datacenter name must not be empty")]
    EmptyName,

    #[error("duplicate datacenter name {0}")]
    DuplicateName(String),

    #[error("datacenter {datacenter} references unknown context {context}")]
    UnknownContext { datacenter: String, context: String },

    #[error("backup.credentialsSecretRef.name is required")]
    MissingCredentialsSecret,

    #[error("backup.storageProperties.storageSecretRef.name is required")]
    MissingStorageSecret,

    #[error("backup.standaloneReplicas must not be negative")]
    NegativeReplicas,
}

/// Builds the Datacenter to write into the template's context
///
/// The pod template of `existing` is kept so fields set by other writers
/// survive; the backup containers are (re)injected on top of it.
/// `rebuilt_from` records a completed rebuild on the object itself so it
/// outlives the cluster status.
pub fn desired_datacenter(
    cluster: &str,
    namespace: &str,
    template: &DatacenterTemplate,
    policy: Option<&BackupPolicy>,
    existing: Option<&Datacenter>,
    rebuilt_from: Option<&str>,
) -> Datacenter {
    let mut pod_template = existing.and_then(|dc| dc.spec.pod_template.clone());
    if let Some(policy) = policy {
        inject_backup_sidecars(
            pod_template.get_or_insert_with(PodTemplateSpec::default),
            cluster,
            policy,
        );
    }
    let annotations = rebuilt_from.map(|source| {
        BTreeMap::from([(REBUILD_COMPLETED_ANNOTATION.to_string(), source.to_string())])
    });

    Datacenter {
        metadata: ObjectMeta {
            name: Some(template.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(datacenter_labels(cluster, namespace, &template.name)),
            annotations,
            ..Default::default()
        },
        spec: DatacenterSpec {
            cluster_name: cluster.to_string(),
            size: template.size,
            server_version: template.server_version.clone(),
            storage_class: template.storage_class.clone(),
            pod_template,
        },
        status: None,
    }
}

pub fn datacenter_drifted(current: &Datacenter, desired: &Datacenter) -> bool {
    current.spec != desired.spec
        || metadata_drifted(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
        || metadata_drifted(
            current.metadata.annotations.as_ref(),
            desired.metadata.annotations.as_ref(),
        )
}

/// Source datacenter recorded by a completed rebuild, if any
pub fn recorded_rebuild_source(datacenter: &Datacenter) -> Option<&str> {
    datacenter
        .metadata
        .annotations
        .as_ref()?
        .get(REBUILD_COMPLETED_ANNOTATION)
        .map(String::as_str)
}

/// Whether the datacenter carries both backup containers
pub fn sidecar_injected(datacenter: &Datacenter, policy: Option<&BackupPolicy>) -> bool {
    policy.is_some() && has_backup_sidecars(datacenter.spec.pod_template.as_ref())
}

/// Rejects specs that can never converge
///
/// `contexts` are the contexts the client can reach.
pub fn validate(cluster: &DatabaseCluster, contexts: &[String]) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    for template in &cluster.spec.datacenters {
        if template.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !names.insert(template.name.as_str()) {
            return Err(ValidationError::DuplicateName(template.name.clone()));
        }
        if !contexts.contains(&template.k8s_context) {
            return Err(ValidationError::UnknownContext {
                datacenter: template.name.clone(),
                context: template.k8s_context.clone(),
            });
        }
    }

    if let Some(policy) = &cluster.spec.backup {
        if policy.credentials_secret_ref.name.trim().is_empty() {
            return Err(ValidationError::MissingCredentialsSecret);
        }
        if policy.storage_properties.storage_secret_ref.name.trim().is_empty() {
            return Err(ValidationError::MissingStorageSecret);
        }
        if policy.standalone_replicas.is_some_and(|r| r < 0) {
            return Err(ValidationError::NegativeReplicas);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{backup_policy, datacenter_template, test_cluster};
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn contexts() -> Vec<String> {
        vec!["control".to_string(), "east".to_string(), "west".to_string()]
    }

    #[test]
    fn test_desired_datacenter_carries_labels_and_sidecars() {
        let policy = backup_policy();
        let template = datacenter_template("dc1", "east");
        let dc = desired_datacenter("test", "db", &template, Some(&policy), None, None);
        assert_eq!(dc.spec.cluster_name, "test");
        assert_eq!(dc.spec.size, 3);
        assert_eq!(
            crds::owning_cluster(dc.metadata.labels.as_ref()),
            Some(("db".to_string(), "test".to_string()))
        );
        assert!(sidecar_injected(&dc, Some(&policy)));
    }

    #[test]
    fn test_desired_datacenter_without_policy_has_no_template() {
        let template = datacenter_template("dc1", "east");
        let dc = desired_datacenter("test", "db", &template, None, None, None);
        assert!(dc.spec.pod_template.is_none());
        assert!(!sidecar_injected(&dc, None));
    }

    #[test]
    fn test_existing_pod_template_is_preserved() {
        let policy = backup_policy();
        let template = datacenter_template("dc1", "east");
        let mut existing = desired_datacenter("test", "db", &template, None, None, None);
        existing.spec.pod_template = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "metrics".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        });

        let dc = desired_datacenter("test", "db", &template, Some(&policy), Some(&existing), None);
        let containers = &dc.spec.pod_template.unwrap().spec.unwrap().containers;
        assert!(containers.iter().any(|c| c.name == "metrics"));
        assert!(containers.iter().any(|c| c.name == "medusa"));
    }

    #[test]
    fn test_drift_on_size_change_only() {
        let policy = backup_policy();
        let mut template = datacenter_template("dc1", "east");
        let live = desired_datacenter("test", "db", &template, Some(&policy), None, None);
        let desired = desired_datacenter("test", "db", &template, Some(&policy), Some(&live), None);
        assert!(!datacenter_drifted(&live, &desired));

        template.size = 5;
        let scaled = desired_datacenter("test", "db", &template, Some(&policy), Some(&live), None);
        assert!(datacenter_drifted(&live, &scaled));
    }

    #[test]
    fn test_validate_accepts_valid_cluster() {
        let cluster = test_cluster("test", &[("dc1", "east"), ("dc2", "west")]);
        assert_eq!(validate(&cluster, &contexts()), Ok(()));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_unknown_contexts() {
        let duplicate = test_cluster("test", &[("dc1", "east"), ("dc1", "west")]);
        assert_eq!(
            validate(&duplicate, &contexts()),
            Err(ValidationError::DuplicateName("dc1".to_string()))
        );

        let unknown = test_cluster("test", &[("dc1", "south")]);
        let err = validate(&unknown, &contexts()).unwrap_err();
        assert_eq!(err.to_string(), "datacenter dc1 references unknown context south");
    }

    #[test]
    fn test_validate_requires_secret_references() {
        let mut cluster = test_cluster("test", &[("dc1", "east")]);
        if let Some(policy) = cluster.spec.backup.as_mut() {
            policy.credentials_secret_ref.name = String::new();
        }
        assert_eq!(validate(&cluster, &contexts()), Err(ValidationError::MissingCredentialsSecret));

        if let Some(policy) = cluster.spec.backup.as_mut() {
            policy.credentials_secret_ref.name = "creds".to_string();
            policy.standalone_replicas = Some(-1);
        }
        assert_eq!(validate(&cluster, &contexts()), Err(ValidationError::NegativeReplicas));
    }

    #[test]
    fn test_completed_rebuild_is_recorded_and_drifts_until_written() {
        let template = datacenter_template("dc2", "west");
        let live = desired_datacenter("test", "db", &template, None, None, None);
        assert_eq!(recorded_rebuild_source(&live), None);

        let desired = desired_datacenter("test", "db", &template, None, Some(&live), Some("dc1"));
        assert_eq!(recorded_rebuild_source(&desired), Some("dc1"));
        assert!(datacenter_drifted(&live, &desired));
        assert!(!datacenter_drifted(&desired, &desired));

        // Not recording again never strips an existing record
        let unrecorded = desired_datacenter("test", "db", &template, None, Some(&desired), None);
        assert!(!datacenter_drifted(&desired, &unrecorded));
    }
}
