//! Rebuild Task Orchestrator
//!
//! Every datacenter after the first joins an already populated cluster and
//! must stream its data from a ready peer. The progress of that one-shot job
//! is tracked per datacenter in the cluster status:
//!
//! ```text
//! NotNeeded -> Pending -> Created -> Completed
//!                            \-> Failed -(rebuildToken changed)-> Pending
//! ```
//!
//! The transitions are pure functions over the previous status and what was
//! read this pass; `reconcile_rebuilds` performs the reads and writes around
//! them. At most one task that is not completed exists per datacenter: a task
//! is only created from `Pending` when none exists, and a failed task is
//! deleted before its datacenter goes back to `Pending`.

use super::Reconciler;
use super::datacenter::recorded_rebuild_source;
use super::observe::{Observation, Observations};
use context_client::{ClusterKey, ContextClientTrait};
use crds::{
    Datacenter, DatacenterStatusEntry, DatacenterTemplate, REBUILD_TOKEN_ANNOTATION, RebuildState,
    RebuildStatus, RebuildTask, RebuildTaskSpec, datacenter_labels, rebuild_task_name,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The datacenter's RebuildTask as read this pass
#[derive(Debug, Clone, PartialEq)]
pub enum TaskObservation {
    Found(Box<RebuildTask>),
    NotFound,
    Unreadable,
}

/// Why a pending rebuild cannot start yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreconditionNotMet {
    #[error("datacenter does not exist yet")]
    TargetMissing,

    #[error("datacenter has not been Ready yet")]
    NeverReady,

    #[error("no preceding datacenter is Ready")]
    NoReadySource,
}

/// Result of advancing the state machine for one datacenter
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildStep {
    pub status: RebuildStatus,
    /// Task to create, only ever emitted from `Pending` when no task exists
    pub create: Option<RebuildTask>,
    /// Stale failed task to remove before a new cycle can start
    pub delete_stale: bool,
    /// Set while `Pending` waits for its preconditions
    pub deferred: Option<PreconditionNotMet>,
}

impl RebuildStep {
    fn stay(status: RebuildStatus) -> Self {
        Self {
            status,
            create: None,
            delete_stale: false,
            deferred: None,
        }
    }
}

/// Everything the transitions need to know about one joining datacenter
#[derive(Debug, Clone, Copy)]
pub struct RebuildContext<'a> {
    pub cluster: &'a str,
    pub namespace: &'a str,
    pub template: &'a DatacenterTemplate,
    pub target: &'a Observation,
    /// The target has reported Ready=True at least once
    pub ready_once: bool,
    /// Nearest preceding datacenter that is Ready=True right now
    pub source: Option<&'a str>,
}

/// Nearest datacenter before `index` (in spec order) that is currently Ready
pub fn select_source<'a>(
    specs: &'a [DatacenterTemplate],
    index: usize,
    observations: &Observations,
) -> Option<&'a str> {
    specs[..index.min(specs.len())]
        .iter()
        .rev()
        .find(|s| observations.get(&s.name).is_some_and(Observation::is_ready))
        .map(|s| s.name.as_str())
}

fn task_token(task: &RebuildTask) -> Option<&str> {
    task.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REBUILD_TOKEN_ANNOTATION))
        .map(String::as_str)
}

/// Entry step: decides whether a joining datacenter starts or restarts a cycle
///
/// * `first_creation` - the sequencer creates the datacenter in this pass
/// * `previous` - the datacenter's entry from the last status, `None` when
///   the datacenter was never tracked or the status was wiped
pub fn arm(
    index: usize,
    template: &DatacenterTemplate,
    previous: Option<&DatacenterStatusEntry>,
    first_creation: bool,
    target: &Observation,
) -> RebuildStep {
    let status = previous.map(|e| e.rebuild.clone()).unwrap_or_default();
    if index == 0 {
        return RebuildStep::stay(RebuildStatus::default());
    }

    match status.state {
        RebuildState::NotNeeded if first_creation => RebuildStep::stay(RebuildStatus {
            state: RebuildState::Pending,
            token: template.rebuild_token.clone(),
            ..Default::default()
        }),
        // Untracked but existing: status was wiped. A completion recorded on the
        // datacenter is final, otherwise the task read re-derives the state.
        RebuildState::NotNeeded if previous.is_none() => match target.datacenter() {
            Some(dc) => match recorded_rebuild_source(dc) {
                Some(source) => RebuildStep::stay(RebuildStatus {
                    state: RebuildState::Completed,
                    source_datacenter: Some(source.to_string()),
                    token: template.rebuild_token.clone(),
                    ..Default::default()
                }),
                None => RebuildStep::stay(RebuildStatus {
                    state: RebuildState::Pending,
                    token: template.rebuild_token.clone(),
                    ..Default::default()
                }),
            },
            None => RebuildStep::stay(status),
        },
        RebuildState::Failed if template.rebuild_token != status.token => RebuildStep {
            status: RebuildStatus {
                state: RebuildState::Pending,
                token: template.rebuild_token.clone(),
                message: Some("rebuild re-armed by rebuildToken change".to_string()),
                ..Default::default()
            },
            create: None,
            delete_stale: true,
            deferred: None,
        },
        _ => RebuildStep::stay(status),
    }
}

/// Source of a completed rebuild to record on the datacenter object
pub fn completed_source<'a>(
    entry: Option<&'a DatacenterStatusEntry>,
    existing: Option<&'a Datacenter>,
) -> Option<&'a str> {
    entry
        .filter(|e| e.rebuild.state == RebuildState::Completed)
        .and_then(|e| e.rebuild.source_datacenter.as_deref())
        .or_else(|| existing.and_then(recorded_rebuild_source))
}

/// Whether the state needs the task to be read this pass
pub fn needs_task(status: &RebuildStatus) -> bool {
    matches!(status.state, RebuildState::Pending | RebuildState::Created)
}

fn adopt(status: &RebuildStatus, task: &RebuildTask) -> RebuildStatus {
    let state = if task.is_completed() {
        RebuildState::Completed
    } else if task.is_failed() {
        RebuildState::Failed
    } else {
        RebuildState::Created
    };
    RebuildStatus {
        state,
        source_datacenter: Some(task.spec.source_datacenter.clone()),
        task: task.metadata.name.clone(),
        token: status.token.clone(),
        message: task.status.as_ref().and_then(|s| s.message.clone()),
    }
}

/// Desired RebuildTask streaming into `ctx.template` from `source`
pub fn desired_rebuild_task(ctx: &RebuildContext<'_>, source: &str) -> RebuildTask {
    let name = rebuild_task_name(&ctx.template.name);
    let annotations = ctx
        .template
        .rebuild_token
        .as_ref()
        .map(|token| BTreeMap::from([(REBUILD_TOKEN_ANNOTATION.to_string(), token.clone())]));
    RebuildTask {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.namespace.to_string()),
            labels: Some(datacenter_labels(ctx.cluster, ctx.namespace, &ctx.template.name)),
            annotations,
            ..Default::default()
        },
        spec: RebuildTaskSpec {
            cluster_name: ctx.cluster.to_string(),
            datacenter: ctx.template.name.clone(),
            source_datacenter: source.to_string(),
        },
        status: None,
    }
}

/// Source datacenter to stream from once the target may be rebuilt
fn preconditions<'a>(ctx: &RebuildContext<'a>) -> Result<&'a str, PreconditionNotMet> {
    if !matches!(ctx.target, Observation::Found(_)) {
        return Err(PreconditionNotMet::TargetMissing);
    }
    if !ctx.ready_once {
        return Err(PreconditionNotMet::NeverReady);
    }
    ctx.source.ok_or(PreconditionNotMet::NoReadySource)
}

/// Advances `Pending` and `Created` using the task read this pass
pub fn advance(
    status: RebuildStatus,
    task: &TaskObservation,
    ctx: &RebuildContext<'_>,
) -> RebuildStep {
    match (status.state, task) {
        (_, TaskObservation::Unreadable) => RebuildStep::stay(status),

        (RebuildState::Pending, TaskObservation::Found(task)) => {
            if task.is_failed() && task_token(task) != ctx.template.rebuild_token.as_deref() {
                // Left over from the previous cycle and still terminating
                return RebuildStep {
                    status: RebuildStatus {
                        message: Some(
                            "waiting for the failed rebuild task to be removed".to_string(),
                        ),
                        ..status
                    },
                    create: None,
                    delete_stale: true,
                    deferred: None,
                };
            }
            RebuildStep::stay(adopt(&status, task))
        }

        (RebuildState::Pending, TaskObservation::NotFound) => match preconditions(ctx) {
            Ok(source) => {
                let task = desired_rebuild_task(ctx, source);
                RebuildStep {
                    status: RebuildStatus {
                        state: RebuildState::Created,
                        source_datacenter: Some(source.to_string()),
                        task: task.metadata.name.clone(),
                        token: status.token,
                        message: None,
                    },
                    create: Some(task),
                    delete_stale: false,
                    deferred: None,
                }
            }
            Err(unmet) => RebuildStep {
                status: RebuildStatus {
                    message: Some(format!("PreconditionNotMet: {}", unmet)),
                    ..status
                },
                create: None,
                delete_stale: false,
                deferred: Some(unmet),
            },
        },

        (RebuildState::Created, TaskObservation::Found(task)) => {
            RebuildStep::stay(adopt(&status, task))
        }

        (RebuildState::Created, TaskObservation::NotFound) => RebuildStep::stay(RebuildStatus {
            state: RebuildState::Pending,
            task: None,
            message: Some("rebuild task disappeared".to_string()),
            ..status
        }),

        _ => RebuildStep::stay(status),
    }
}

impl Reconciler {
    /// Runs the rebuild state machine for every joining datacenter
    ///
    /// Returns the new rebuild status of each datacenter that has one; remote
    /// errors leave the previous status in place for the next pass.
    pub(crate) async fn reconcile_rebuilds(
        &self,
        cluster: &str,
        namespace: &str,
        specs: &[DatacenterTemplate],
        previous: &BTreeMap<String, DatacenterStatusEntry>,
        observations: &Observations,
        first_creations: &[String],
    ) -> BTreeMap<String, RebuildStatus> {
        let mut result = BTreeMap::new();

        for (index, template) in specs.iter().enumerate().skip(1) {
            let entry = previous.get(&template.name);
            let target = observations.get(&template.name).unwrap_or(&Observation::NotFound);
            let first_creation = first_creations.contains(&template.name);
            let key = ClusterKey::new(
                &template.k8s_context,
                namespace,
                rebuild_task_name(&template.name),
            );

            let armed = arm(index, template, entry, first_creation, target);
            if armed.status.state == RebuildState::NotNeeded && entry.is_none() {
                continue;
            }
            if armed.delete_stale && !self.delete_stale_task(&key).await {
                if let Some(entry) = entry {
                    result.insert(template.name.clone(), entry.rebuild.clone());
                }
                continue;
            }

            let mut status = armed.status;
            let mut deferred = None;
            if needs_task(&status) {
                let task = match self.client.get_rebuild_task(&key).await {
                    Ok(task) => TaskObservation::Found(Box::new(task)),
                    Err(e) if e.is_not_found() => TaskObservation::NotFound,
                    Err(e) => {
                        warn!("Could not read rebuild task {}: {}", key, e);
                        TaskObservation::Unreadable
                    }
                };
                let ctx = RebuildContext {
                    cluster,
                    namespace,
                    template,
                    target,
                    ready_once: entry.is_some_and(|e| e.ready_once) || target.is_ready(),
                    source: select_source(specs, index, observations),
                };
                let step = advance(status.clone(), &task, &ctx);
                deferred = step.deferred;
                if step.delete_stale {
                    self.delete_stale_task(&key).await;
                }
                status = match step.create {
                    Some(task) => match self.client.create_rebuild_task(&key, &task).await {
                        Ok(_) => {
                            info!(
                                "Created rebuild task {} streaming {} from {}",
                                key,
                                template.name,
                                task.spec.source_datacenter
                            );
                            step.status
                        }
                        Err(e) => {
                            // AlreadyExists is adopted by the next read
                            warn!("Failed to create rebuild task {}: {}", key, e);
                            RebuildStatus {
                                message: Some(e.to_string()),
                                ..status
                            }
                        }
                    },
                    None => step.status,
                };
            }

            if let Some(unmet) = deferred {
                debug!("Rebuild of {} deferred: {}", template.name, unmet);
            }
            result.insert(template.name.clone(), status);
        }

        result
    }

    /// Deletes a failed task; false when the delete must be retried
    async fn delete_stale_task(&self, key: &ClusterKey) -> bool {
        match self.client.delete_rebuild_task(key).await {
            Ok(()) => {
                info!("Deleted failed rebuild task {}", key);
                true
            }
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!("Failed to delete rebuild task {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{datacenter_template, observed_datacenter};
    use crds::RebuildTaskStatus;

    fn templates() -> Vec<DatacenterTemplate> {
        vec![
            datacenter_template("dc1", "east"),
            datacenter_template("dc2", "west"),
            datacenter_template("dc3", "north"),
        ]
    }

    fn ctx<'a>(
        template: &'a DatacenterTemplate,
        target: &'a Observation,
        ready_once: bool,
        source: Option<&'a str>,
    ) -> RebuildContext<'a> {
        RebuildContext {
            cluster: "test",
            namespace: "db",
            template,
            target,
            ready_once,
            source,
        }
    }

    fn pending() -> RebuildStatus {
        RebuildStatus {
            state: RebuildState::Pending,
            ..Default::default()
        }
    }

    fn task(status: Option<RebuildTaskStatus>, token: Option<&str>) -> TaskObservation {
        let mut task = RebuildTask::new(
            "dc2-rebuild",
            RebuildTaskSpec {
                cluster_name: "test".to_string(),
                datacenter: "dc2".to_string(),
                source_datacenter: "dc1".to_string(),
            },
        );
        task.status = status;
        if let Some(token) = token {
            task.metadata.annotations = Some(BTreeMap::from([(
                REBUILD_TOKEN_ANNOTATION.to_string(),
                token.to_string(),
            )]));
        }
        TaskObservation::Found(Box::new(task))
    }

    fn entry(rebuild: RebuildStatus) -> DatacenterStatusEntry {
        DatacenterStatusEntry {
            rebuild,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_datacenter_never_rebuilds() {
        let step = arm(0, &templates()[0], None, true, &Observation::NotFound);
        assert_eq!(step.status.state, RebuildState::NotNeeded);
    }

    #[test]
    fn test_first_creation_arms_pending() {
        let step = arm(1, &templates()[1], None, true, &Observation::NotFound);
        assert_eq!(step.status.state, RebuildState::Pending);
        assert!(!step.delete_stale);
    }

    #[test]
    fn test_scale_up_does_not_arm() {
        let previous = entry(RebuildStatus::default());
        let found = observed_datacenter("dc2", true, true);
        let step = arm(1, &templates()[1], Some(&previous), false, &found);
        assert_eq!(step.status.state, RebuildState::NotNeeded);
    }

    #[test]
    fn test_wiped_status_rearms_existing_datacenter() {
        let found = observed_datacenter("dc2", true, true);
        let step = arm(1, &templates()[1], None, false, &found);
        assert_eq!(step.status.state, RebuildState::Pending);
    }

    #[test]
    fn test_wiped_status_keeps_recorded_completion() {
        let Observation::Found(mut dc) = observed_datacenter("dc2", true, true) else {
            panic!("observed datacenter");
        };
        dc.metadata.annotations = Some(BTreeMap::from([(
            crds::REBUILD_COMPLETED_ANNOTATION.to_string(),
            "dc1".to_string(),
        )]));
        let found = Observation::Found(dc);

        let step = arm(1, &templates()[1], None, false, &found);
        assert_eq!(step.status.state, RebuildState::Completed);
        assert_eq!(step.status.source_datacenter.as_deref(), Some("dc1"));
        assert!(!needs_task(&step.status));
    }

    #[test]
    fn test_wiped_status_ignores_missing_datacenter() {
        let step = arm(1, &templates()[1], None, false, &Observation::NotFound);
        assert_eq!(step.status.state, RebuildState::NotNeeded);
    }

    #[test]
    fn test_completed_source_prefers_status_then_record() {
        let completed = entry(RebuildStatus {
            state: RebuildState::Completed,
            source_datacenter: Some("dc1".to_string()),
            ..Default::default()
        });
        assert_eq!(completed_source(Some(&completed), None), Some("dc1"));
        assert_eq!(completed_source(Some(&entry(pending())), None), None);

        let mut recorded = Datacenter::new("dc3", Default::default());
        recorded.metadata.annotations = Some(BTreeMap::from([(
            crds::REBUILD_COMPLETED_ANNOTATION.to_string(),
            "dc2".to_string(),
        )]));
        assert_eq!(completed_source(None, Some(&recorded)), Some("dc2"));
    }

    #[test]
    fn test_pending_waits_for_target_first_ready() {
        let templates = templates();
        let target = observed_datacenter("dc2", false, true);
        let context = ctx(&templates[1], &target, false, Some("dc1"));
        let step = advance(pending(), &TaskObservation::NotFound, &context);
        assert_eq!(step.status.state, RebuildState::Pending);
        assert!(step.create.is_none());
        assert_eq!(step.deferred, Some(PreconditionNotMet::NeverReady));
        assert_eq!(
            step.status.message.as_deref(),
            Some("PreconditionNotMet: datacenter has not been Ready yet")
        );
    }

    #[test]
    fn test_pending_waits_for_ready_source() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let context = ctx(&templates[1], &target, true, None);
        let step = advance(pending(), &TaskObservation::NotFound, &context);
        assert_eq!(step.status.state, RebuildState::Pending);
        assert!(step.create.is_none());
        assert_eq!(step.deferred, Some(PreconditionNotMet::NoReadySource));
    }

    #[test]
    fn test_pending_creates_exactly_one_task() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let context = ctx(&templates[1], &target, true, Some("dc1"));
        let step = advance(pending(), &TaskObservation::NotFound, &context);
        assert_eq!(step.status.state, RebuildState::Created);
        assert_eq!(step.status.source_datacenter.as_deref(), Some("dc1"));
        assert_eq!(step.status.task.as_deref(), Some("dc2-rebuild"));

        let created = step.create.unwrap();
        assert_eq!(created.spec.datacenter, "dc2");
        assert_eq!(created.spec.source_datacenter, "dc1");
    }

    #[test]
    fn test_pending_adopts_existing_task() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let context = ctx(&templates[1], &target, true, Some("dc1"));
        let step = advance(pending(), &task(None, None), &context);
        assert_eq!(step.status.state, RebuildState::Created);
        assert!(step.create.is_none(), "an existing task is never duplicated");
    }

    #[test]
    fn test_created_completes_and_stays_completed() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let context = ctx(&templates[1], &target, true, Some("dc1"));
        let created = RebuildStatus {
            state: RebuildState::Created,
            ..Default::default()
        };
        let done = task(Some(RebuildTaskStatus { completed: true, ..Default::default() }), None);

        let step = advance(created, &done, &context);
        assert_eq!(step.status.state, RebuildState::Completed);
        assert!(!needs_task(&step.status));

        let again = arm(1, &templates[1], Some(&entry(step.status.clone())), false, &target);
        assert_eq!(again.status, step.status);
    }

    #[test]
    fn test_created_surfaces_failure_without_retry() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let created = RebuildStatus {
            state: RebuildState::Created,
            ..Default::default()
        };
        let failed = task(
            Some(RebuildTaskStatus {
                failed: true,
                message: Some("stream aborted".to_string()),
                ..Default::default()
            }),
            None,
        );
        let step = advance(created, &failed, &ctx(&templates[1], &target, true, Some("dc1")));
        assert_eq!(step.status.state, RebuildState::Failed);
        assert_eq!(step.status.message.as_deref(), Some("stream aborted"));

        let again = arm(1, &templates[1], Some(&entry(step.status.clone())), false, &target);
        assert_eq!(again.status.state, RebuildState::Failed);
        assert!(!again.delete_stale);
    }

    #[test]
    fn test_token_change_rearms_failed_rebuild() {
        let mut template = datacenter_template("dc2", "west");
        let failed = RebuildStatus {
            state: RebuildState::Failed,
            token: None,
            ..Default::default()
        };
        template.rebuild_token = Some("retry-1".to_string());

        let target = observed_datacenter("dc2", true, true);
        let step = arm(1, &template, Some(&entry(failed)), false, &target);
        assert_eq!(step.status.state, RebuildState::Pending);
        assert_eq!(step.status.token.as_deref(), Some("retry-1"));
        assert!(step.delete_stale);
    }

    #[test]
    fn test_pending_does_not_adopt_stale_failed_task() {
        let mut template = datacenter_template("dc2", "west");
        template.rebuild_token = Some("retry-1".to_string());
        let target = observed_datacenter("dc2", true, true);
        let stale = task(Some(RebuildTaskStatus { failed: true, ..Default::default() }), None);

        let step = advance(pending(), &stale, &ctx(&template, &target, true, Some("dc1")));
        assert_eq!(step.status.state, RebuildState::Pending);
        assert!(step.delete_stale);
        assert!(step.create.is_none());
    }

    #[test]
    fn test_created_task_disappearing_returns_to_pending() {
        let templates = templates();
        let target = observed_datacenter("dc2", true, true);
        let created = RebuildStatus {
            state: RebuildState::Created,
            task: Some("dc2-rebuild".to_string()),
            ..Default::default()
        };
        let context = ctx(&templates[1], &target, true, Some("dc1"));
        let step = advance(created, &TaskObservation::NotFound, &context);
        assert_eq!(step.status.state, RebuildState::Pending);
        assert!(step.create.is_none());
    }

    #[test]
    fn test_select_source_skips_unready_predecessor() {
        let templates = templates();
        let observations: Observations = [
            ("dc1".to_string(), observed_datacenter("dc1", true, true)),
            ("dc2".to_string(), observed_datacenter("dc2", false, true)),
        ]
        .into_iter()
        .collect();
        assert_eq!(select_source(&templates, 2, &observations), Some("dc1"));
        assert_eq!(select_source(&templates, 0, &observations), None);
    }
}
