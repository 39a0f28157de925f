//! Per-pass observation of remote datacenters.

use super::Reconciler;
use context_client::{ClusterKey, ContextClientTrait};
use crds::{ConditionStatus, DatabaseCluster, Datacenter};
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::warn;

/// What the controller could see of one datacenter this pass
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Found(Box<Datacenter>),
    /// Not created yet
    NotFound,
    /// Context unreachable or any other transient read failure
    Unreadable(String),
}

impl Observation {
    pub fn datacenter(&self) -> Option<&Datacenter> {
        match self {
            Observation::Found(dc) => Some(dc),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.datacenter()
            .is_some_and(|dc| dc.ready_status() == ConditionStatus::True)
    }

    /// Ready with the latest spec revision processed
    pub fn is_settled(&self) -> bool {
        self.datacenter().is_some_and(|dc| {
            dc.ready_status() == ConditionStatus::True && dc.generation_observed()
        })
    }
}

/// Observations keyed by datacenter name
pub type Observations = BTreeMap<String, Observation>;

impl Reconciler {
    /// Reads every datacenter of the cluster concurrently
    pub(crate) async fn observe_datacenters(
        &self,
        cluster: &DatabaseCluster,
        namespace: &str,
    ) -> Observations {
        let reads = cluster.spec.datacenters.iter().map(|template| {
            let key = ClusterKey::new(&template.k8s_context, namespace, &template.name);
            let client = &self.client;
            async move {
                let observation = match client.get_datacenter(&key).await {
                    Ok(dc) => Observation::Found(Box::new(dc)),
                    Err(e) if e.is_not_found() => Observation::NotFound,
                    Err(e) => {
                        warn!("Could not observe datacenter {}: {}", key, e);
                        Observation::Unreadable(e.to_string())
                    }
                };
                (key.name, observation)
            }
        });
        join_all(reads).await.into_iter().collect()
    }
}
