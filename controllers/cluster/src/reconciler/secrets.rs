//! Secret Replicator
//!
//! Copies the secrets referenced by the backup policy from the cluster's
//! namespace in the control plane into the same namespace of every
//! datacenter context. Sequencing does not start until every copy is in place.

use super::Reconciler;
use crate::reconcile_helpers::{ensure_object, metadata_drifted};
use context_client::{ClusterKey, ContextClientTrait, ObjectKind};
use crds::{DatacenterTemplate, cluster_labels};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, warn};

/// Outcome of one replication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    Done,
    /// Prerequisites not met, with the first reason found
    Pending(String),
}

impl Replication {
    pub fn is_done(&self) -> bool {
        matches!(self, Replication::Done)
    }
}

/// Distinct datacenter contexts other than `source_context`, in spec order
pub fn target_contexts(specs: &[DatacenterTemplate], source_context: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for spec in specs {
        if spec.k8s_context != source_context && !targets.contains(&spec.k8s_context) {
            targets.push(spec.k8s_context.clone());
        }
    }
    targets
}

/// Replica of `source` for another context, owned by the cluster
pub fn replica_of(source: &Secret, cluster: &str, namespace: &str) -> Secret {
    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.extend(cluster_labels(cluster, namespace));
    Secret {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: source.data.clone(),
        type_: source.type_.clone(),
        ..Default::default()
    }
}

fn replica_drifted(current: &Secret, desired: &Secret) -> bool {
    metadata_drifted(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
        || current.data != desired.data
        || current.type_ != desired.type_
}

impl Reconciler {
    /// Ensures every named secret exists in every target context
    pub(crate) async fn ensure_replicated(
        &self,
        cluster: &str,
        namespace: &str,
        secret_names: &[String],
        source_context: &str,
        targets: &[String],
    ) -> Replication {
        for name in secret_names {
            let source_key = ClusterKey::new(source_context, namespace, name);
            let source = match self.client.get_secret(&source_key).await {
                Ok(secret) => secret,
                Err(e) if e.is_not_found() => {
                    warn!(
                        "Secret {} referenced by {}/{} does not exist",
                        source_key, namespace, cluster
                    );
                    return Replication::Pending(format!("secret {} not found", name));
                }
                Err(e) => return Replication::Pending(e.to_string()),
            };
            let replica = replica_of(&source, cluster, namespace);

            let copies = targets.iter().map(|context| {
                let key = ClusterKey::new(context, namespace, name);
                let replica = &replica;
                async move {
                    let result = ensure_object(
                        ObjectKind::Secret,
                        &key,
                        || self.client.get_secret(&key),
                        |current| replica_drifted(current, replica),
                        self.client.create_secret(&key, replica),
                        self.client.patch_secret(&key, replica),
                    )
                    .await;
                    result.map_err(|e| format!("replicating {}: {}", key, e))
                }
            });
            if let Some(Err(reason)) = join_all(copies).await.into_iter().find(Result::is_err) {
                return Replication::Pending(reason);
            }
            debug!("Secret {} replicated to {:?}", name, targets);
        }
        Replication::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{datacenter_template, test_reconciler};
    use context_client::{MockContextClient, WriteOp};
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn source_secret(value: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn setup() -> (MockContextClient, Reconciler) {
        let mock = MockContextClient::new("control", &["east", "west"]);
        let reconciler = test_reconciler(&mock);
        (mock, reconciler)
    }

    #[test]
    fn test_target_contexts_dedup_and_skip_source() {
        let specs = vec![
            datacenter_template("dc1", "east"),
            datacenter_template("dc2", "control"),
            datacenter_template("dc3", "east"),
            datacenter_template("dc4", "west"),
        ];
        assert_eq!(target_contexts(&specs, "control"), vec!["east", "west"]);
    }

    #[tokio::test]
    async fn test_missing_source_is_pending() {
        let (_mock, reconciler) = setup();
        let result = reconciler
            .ensure_replicated(
                "test",
                "db",
                &["medusa-secret".to_string()],
                "control",
                &["east".to_string()],
            )
            .await;
        assert!(matches!(result, Replication::Pending(reason) if reason.contains("medusa-secret")));
    }

    #[tokio::test]
    async fn test_replicates_once_and_updates_on_drift() {
        let (mock, reconciler) = setup();
        mock.insert_secret(&ClusterKey::new("control", "db", "medusa-secret"), source_secret("a"));
        let names = vec!["medusa-secret".to_string()];
        let targets = vec!["east".to_string(), "west".to_string()];

        let result = reconciler.ensure_replicated("test", "db", &names, "control", &targets).await;
        assert_eq!(result, Replication::Done);
        assert_eq!(mock.count_writes(WriteOp::Create, ObjectKind::Secret), 2);
        let replica = mock.secret(&ClusterKey::new("west", "db", "medusa-secret")).unwrap();
        assert_eq!(replica.data, source_secret("a").data);
        assert_eq!(
            crds::owning_cluster(replica.metadata.labels.as_ref()),
            Some(("db".to_string(), "test".to_string()))
        );

        mock.clear_writes();
        reconciler.ensure_replicated("test", "db", &names, "control", &targets).await;
        assert_eq!(mock.write_count(), 0, "unchanged secrets are not rewritten");

        mock.insert_secret(&ClusterKey::new("control", "db", "medusa-secret"), source_secret("b"));
        reconciler.ensure_replicated("test", "db", &names, "control", &targets).await;
        assert_eq!(mock.count_writes(WriteOp::Patch, ObjectKind::Secret), 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_pending() {
        let (mock, reconciler) = setup();
        mock.insert_secret(&ClusterKey::new("control", "db", "medusa-secret"), source_secret("a"));
        mock.set_unreachable("west", true);

        let result = reconciler
            .ensure_replicated(
                "test",
                "db",
                &["medusa-secret".to_string()],
                "control",
                &["east".to_string(), "west".to_string()],
            )
            .await;
        assert!(!result.is_done());
        assert!(mock.secret(&ClusterKey::new("east", "db", "medusa-secret")).is_some());
    }
}
