//! Reconciliation logic for DatabaseCluster resources.
//!
//! One pass runs these steps in order, each consuming what the previous ones
//! established:
//! - `secrets`: replicate prerequisite secrets into every datacenter context
//! - `observe` + `sequencer`: read remote datacenters and decide what may be
//!   created or updated
//! - `datacenter` + `backup`: write eligible datacenters with the backup
//!   sidecars injected, plus their standalone backup resources
//! - `rebuild`: drive the rebuild task of every joining datacenter
//! - `status`: fold everything into the cluster status
//!
//! A cluster marked for deletion runs the `deletion` cascade instead.

pub mod backup;
pub mod datacenter;
pub mod deletion;
pub mod observe;
pub mod rebuild;
pub mod secrets;
pub mod sequencer;
pub mod status;


use crate::backoff::FibonacciBackoff;
use crate::config::Settings;
use crate::error::ControllerError;
use crate::reconcile_helpers::status_needs_update;
use backup::required_secret_names;
use chrono::Utc;
use context_client::{ClusterKey, ContextClientTrait};
use crds::{
    BackupPolicy, CLEANUP_FINALIZER, DatabaseCluster, DatabaseClusterStatus, DatacenterStatusEntry,
    DatacenterTemplate, RebuildState,
};
use deletion::Cleanup;
use futures::future::join_all;
use observe::Observation;
use secrets::{Replication, target_contexts};
use sequencer::Eligibility;
use status::{Facts, LocalFacts};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Backoff state for a cluster
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_seconds, max_seconds),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// What a finished pass asks of the controller runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Everything converged; wait for the next change
    Converged,
    /// Remote progress pending; look again after the waiting interval
    Waiting,
    /// Transient failures were caught inside the pass; retry with backoff
    Retry,
    /// The cluster definition is invalid; nothing happens until it is edited
    Blocked,
    /// Cleanup finished and the finalizer is gone
    Deleted,
}

/// One eligible datacenter to write this pass
struct DatacenterWrite<'a> {
    template: &'a DatacenterTemplate,
    eligibility: Eligibility,
    observation: Observation,
    /// Entry from the last written status
    entry: Option<&'a DatacenterStatusEntry>,
}

/// Result of writing one datacenter this pass
struct DatacenterOutcome {
    name: String,
    facts: LocalFacts,
    /// Fresh object when a write went through
    observed: Option<Observation>,
    failed: bool,
}

/// Reconciles DatabaseCluster resources across contexts.
pub struct Reconciler {
    pub(crate) client: Box<dyn ContextClientTrait + Send + Sync>,
    pub(crate) settings: Settings,
    /// Error count tracking per cluster (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: impl ContextClientTrait + Send + Sync + 'static,
        settings: Settings,
    ) -> Self {
        Self {
            client: Box::new(client),
            settings,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs one reconciliation pass for a cluster
    pub async fn reconcile_cluster(
        &self,
        cluster: &DatabaseCluster,
    ) -> Result<PassOutcome, ControllerError> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .ok_or(ControllerError::MissingObjectKey("metadata.name"))?;
        let namespace = cluster
            .metadata
            .namespace
            .as_deref()
            .ok_or(ControllerError::MissingObjectKey("metadata.namespace"))?;
        let key = ClusterKey::new(self.client.control_plane_context(), namespace, name);

        if cluster.metadata.deletion_timestamp.is_some() {
            return Ok(match self.cleanup_cluster(cluster, name, namespace).await? {
                Cleanup::Done => PassOutcome::Deleted,
                Cleanup::InProgress => PassOutcome::Waiting,
            });
        }

        self.ensure_finalizer(cluster, &key).await?;

        let previous = cluster.status.as_ref();
        if let Err(invalid) = datacenter::validate(cluster, &self.client.contexts()) {
            error!("DatabaseCluster {}/{} has a configuration error: {}", namespace, name, invalid);
            let desired = status::configuration_error(
                previous,
                &invalid.to_string(),
                cluster.metadata.generation,
                Utc::now(),
            );
            self.write_status(&key, previous, &desired).await?;
            return Ok(PassOutcome::Blocked);
        }

        let specs = &cluster.spec.datacenters;
        let policy = cluster.spec.backup.as_ref();

        // Secrets
        let control_plane = self.client.control_plane_context().to_string();
        let secret_names = policy.map(required_secret_names).unwrap_or_default();
        let replication = self
            .ensure_replicated(
                name,
                namespace,
                &secret_names,
                &control_plane,
                &target_contexts(specs, &control_plane),
            )
            .await;
        if let Replication::Pending(reason) = &replication {
            info!("DatabaseCluster {}/{} waiting for secrets: {}", namespace, name, reason);
        }

        // Sequencer
        let previous_entries = previous.map(|s| s.datacenters.clone()).unwrap_or_default();
        let mut observations = self.observe_datacenters(cluster, namespace).await;
        let pending_updates: BTreeSet<String> = specs
            .iter()
            .filter(|template| {
                observations
                    .get(&template.name)
                    .and_then(Observation::datacenter)
                    .is_some_and(|current| {
                        // Only spec writes roll the datacenter out again
                        let desired = datacenter::desired_datacenter(
                            name,
                            namespace,
                            template,
                            policy,
                            Some(current),
                            None,
                        );
                        current.spec != desired.spec
                    })
            })
            .map(|template| template.name.clone())
            .collect();
        let plan = sequencer::plan(specs, &observations, &pending_updates, replication.is_done());
        debug!("DatabaseCluster {}/{} plan: {:?}", namespace, name, plan.decisions);

        // Injector and datacenters, one context each
        let writes = specs.iter().filter_map(|template| {
            let eligibility = plan.decision(&template.name)?.clone();
            let observation = observations
                .get(&template.name)
                .cloned()
                .unwrap_or(Observation::NotFound);
            let write = DatacenterWrite {
                template,
                eligibility,
                observation,
                entry: previous_entries.get(&template.name),
            };
            write
                .eligibility
                .is_eligible()
                .then(|| self.apply_datacenter(name, namespace, policy, write))
        });
        let mut facts = Facts::new();
        let mut first_creations = Vec::new();
        let mut failed = false;
        for outcome in join_all(writes).await {
            if outcome.facts.created {
                first_creations.push(outcome.name.clone());
            }
            if let Some(observed) = outcome.observed {
                observations.insert(outcome.name.clone(), observed);
            }
            failed |= outcome.failed;
            facts.insert(outcome.name, outcome.facts);
        }

        // Rebuild tasks
        let rebuilds = self
            .reconcile_rebuilds(
                name,
                namespace,
                specs,
                &previous_entries,
                &observations,
                &first_creations,
            )
            .await;
        let rebuild_waiting = rebuilds
            .values()
            .any(|r| matches!(r.state, RebuildState::Pending | RebuildState::Created));
        for (dc, rebuild) in rebuilds {
            facts.entry(dc).or_default().rebuild = Some(rebuild);
        }

        // Status
        let desired = status::aggregate(
            specs,
            previous,
            &observations,
            &facts,
            cluster.metadata.generation,
            Utc::now(),
        );
        self.write_status(&key, previous, &desired).await?;

        let outcome = if failed {
            PassOutcome::Retry
        } else if plan.requeue || rebuild_waiting || !replication.is_done() || !desired.ready {
            PassOutcome::Waiting
        } else {
            PassOutcome::Converged
        };
        info!("DatabaseCluster {}/{} pass finished: {:?}", namespace, name, outcome);
        Ok(outcome)
    }

    /// Creates or updates one eligible datacenter, then its standalone backup
    ///
    /// Errors stay local to this datacenter.
    async fn apply_datacenter(
        &self,
        cluster: &str,
        namespace: &str,
        policy: Option<&BackupPolicy>,
        write: DatacenterWrite<'_>,
    ) -> DatacenterOutcome {
        let DatacenterWrite {
            template,
            eligibility,
            observation,
            entry,
        } = write;
        let key = ClusterKey::new(&template.k8s_context, namespace, &template.name);
        let existing = observation.datacenter();
        let rebuilt_from = rebuild::completed_source(entry, existing);
        let desired = datacenter::desired_datacenter(
            cluster,
            namespace,
            template,
            policy,
            existing,
            rebuilt_from,
        );

        let written = match (&eligibility, existing) {
            (Eligibility::Create, _) => {
                info!("Creating datacenter {}", key);
                self.client.create_datacenter(&key, &desired).await.map(Some)
            }
            (_, Some(current)) if datacenter::datacenter_drifted(current, &desired) => {
                info!("Datacenter {} drifted from desired state, updating", key);
                self.client.patch_datacenter(&key, &desired).await.map(Some)
            }
            _ => Ok(None),
        };

        let mut outcome = DatacenterOutcome {
            name: template.name.clone(),
            facts: LocalFacts::default(),
            observed: None,
            failed: false,
        };
        match written {
            Ok(Some(dc)) => {
                outcome.facts.created = eligibility == Eligibility::Create;
                outcome.facts.sidecar_injected = Some(datacenter::sidecar_injected(&dc, policy));
                outcome.observed = Some(Observation::Found(Box::new(dc)));
            }
            Ok(None) => {
                outcome.facts.sidecar_injected =
                    existing.map(|dc| datacenter::sidecar_injected(dc, policy));
            }
            Err(e) => {
                warn!("Failed to write datacenter {}: {}, will retry", key, e);
                outcome.failed = true;
            }
        }

        if let Some(policy) = policy {
            let backup = self.ensure_standalone_backup(cluster, namespace, template, policy).await;
            outcome.failed |= backup.error.is_some();
            outcome.facts.standalone_backup = Some(backup);
        }
        outcome
    }

    async fn ensure_finalizer(
        &self,
        cluster: &DatabaseCluster,
        key: &ClusterKey,
    ) -> Result<(), ControllerError> {
        let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == CLEANUP_FINALIZER) {
            return Ok(());
        }
        finalizers.push(CLEANUP_FINALIZER.to_string());
        self.client.set_cluster_finalizers(key, &finalizers).await?;
        debug!("Added finalizer to {}", key);
        Ok(())
    }

    /// Writes the status only when it changed
    async fn write_status(
        &self,
        key: &ClusterKey,
        current: Option<&DatabaseClusterStatus>,
        desired: &DatabaseClusterStatus,
    ) -> Result<(), ControllerError> {
        if !status_needs_update(current, desired) {
            debug!("Status of {} unchanged, skipping update", key);
            return Ok(());
        }
        self.client.patch_cluster_status(key, desired).await?;
        debug!("Updated status of {}", key);
        Ok(())
    }

    /// Get the Fibonacci backoff duration for a cluster based on its error count
    ///
    /// Returns (backoff, error_count)
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(resource_key.to_string()).or_insert_with(|| {
                    BackoffState::new(
                        self.settings.backoff_min_seconds,
                        self.settings.backoff_max_seconds,
                    )
                });
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (Duration::from_secs(self.settings.backoff_max_seconds), 0)
            }
        }
    }

    /// Increment error count for a cluster
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states
                .entry(resource_key.to_string())
                .or_insert_with(|| {
                    BackoffState::new(
                        self.settings.backoff_min_seconds,
                        self.settings.backoff_max_seconds,
                    )
                })
                .increment_error();
        }
    }

    /// Reset error count for a cluster (on a pass without transient failures)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
