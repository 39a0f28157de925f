//! Well-known labels, annotations and finalizers
//!
//! Every remote object created on behalf of a DatabaseCluster carries the
//! cluster name and namespace labels so remote watches can be mapped back to
//! the owning cluster.

use std::collections::BTreeMap;

pub const CLUSTER_NAME_LABEL: &str = "multidc.microscaler.io/cluster-name";
pub const CLUSTER_NAMESPACE_LABEL: &str = "multidc.microscaler.io/cluster-namespace";
pub const DATACENTER_LABEL: &str = "multidc.microscaler.io/datacenter";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "multidc-cluster-controller";

/// Comma-separated names of the secrets mounted into the database pods
pub const INJECTED_SECRETS_ANNOTATION: &str = "multidc.microscaler.io/injected-secrets";

/// `rebuildToken` a RebuildTask was created for
pub const REBUILD_TOKEN_ANNOTATION: &str = "multidc.microscaler.io/rebuild-token";

/// Source datacenter of the rebuild a joining Datacenter completed
pub const REBUILD_COMPLETED_ANNOTATION: &str = "multidc.microscaler.io/rebuild-completed";

pub const CLEANUP_FINALIZER: &str = "multidc.microscaler.io/cleanup";

/// Labels identifying an object owned by a cluster
pub fn cluster_labels(cluster_name: &str, cluster_namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (CLUSTER_NAMESPACE_LABEL.to_string(), cluster_namespace.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Labels identifying an object owned by one datacenter of a cluster
pub fn datacenter_labels(
    cluster_name: &str,
    cluster_namespace: &str,
    datacenter: &str,
) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name, cluster_namespace);
    labels.insert(DATACENTER_LABEL.to_string(), datacenter.to_string());
    labels
}

/// Extracts the owning cluster `(namespace, name)` from object labels
pub fn owning_cluster(labels: Option<&BTreeMap<String, String>>) -> Option<(String, String)> {
    let labels = labels?;
    let name = labels.get(CLUSTER_NAME_LABEL)?;
    let namespace = labels.get(CLUSTER_NAMESPACE_LABEL)?;
    Some((namespace.clone(), name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owning_cluster_roundtrip() {
        let labels = datacenter_labels("test", "ns", "dc1");
        assert_eq!(owning_cluster(Some(&labels)), Some(("ns".to_string(), "test".to_string())));
        assert_eq!(labels.get(DATACENTER_LABEL).map(String::as_str), Some("dc1"));
    }

    #[test]
    fn test_owning_cluster_requires_both_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_NAME_LABEL.to_string(), "test".to_string());
        assert_eq!(owning_cluster(Some(&labels)), None);
        assert_eq!(owning_cluster(None), None);
    }
}
