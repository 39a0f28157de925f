//! Status Aggregator
//!
//! Folds this pass's observations and locally established facts into the
//! cluster status. The function is pure: the same inputs always produce the
//! same status, so a pass that changes nothing produces nothing to write.

use super::observe::{Observation, Observations};
use chrono::{DateTime, Utc};
use crds::{
    CONDITION_READY, ConditionStatus, DatabaseClusterStatus, DatacenterCondition,
    DatacenterStatusEntry, DatacenterTemplate, RebuildStatus, StandaloneBackupStatus,
    find_condition,
};
use std::collections::BTreeMap;

pub const REASON_ALL_READY: &str = "AllDatacentersReady";
pub const REASON_NOT_READY: &str = "DatacentersNotReady";
pub const REASON_NO_DATACENTERS: &str = "NoDatacenters";
pub const REASON_CONFIGURATION_ERROR: &str = "ConfigurationError";

/// Facts the controller established itself for one datacenter this pass
///
/// `None` keeps whatever the previous status recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalFacts {
    /// A create for the datacenter was issued this pass
    pub created: bool,
    pub sidecar_injected: Option<bool>,
    pub standalone_backup: Option<StandaloneBackupStatus>,
    pub rebuild: Option<RebuildStatus>,
}

pub type Facts = BTreeMap<String, LocalFacts>;

/// Remote conditions copied verbatim, with Ready always present
pub fn condition_snapshot(conditions: &[DatacenterCondition]) -> Vec<DatacenterCondition> {
    let mut snapshot = conditions.to_vec();
    if find_condition(&snapshot, CONDITION_READY).is_none() {
        snapshot.push(DatacenterCondition::new(CONDITION_READY, ConditionStatus::Unknown));
    }
    snapshot
}

fn entry_ready(entry: &DatacenterStatusEntry) -> ConditionStatus {
    find_condition(&entry.conditions, CONDITION_READY)
        .map(|c| c.status)
        .unwrap_or_default()
}

/// Carries over the previous transition time when the status did not change
fn transition(
    previous: &[DatacenterCondition],
    mut condition: DatacenterCondition,
    now: DateTime<Utc>,
) -> DatacenterCondition {
    condition.last_transition_time = match find_condition(previous, &condition.type_) {
        Some(old) if old.status == condition.status => old.last_transition_time,
        _ => Some(now),
    };
    condition
}

/// Computes the cluster status for this pass
///
/// * `specs` - datacenters in spec order
/// * `previous` - status written by the last successful pass
/// * `observations` - remote datacenters read this pass
/// * `facts` - sidecar, standalone backup and rebuild facts from this pass
/// * `now` - timestamp for cluster condition transitions
pub fn aggregate(
    specs: &[DatacenterTemplate],
    previous: Option<&DatabaseClusterStatus>,
    observations: &Observations,
    facts: &Facts,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> DatabaseClusterStatus {
    let empty = DatabaseClusterStatus::default();
    let previous = previous.unwrap_or(&empty);
    // Datacenters dropped from `spec.datacenters` keep their last snapshot
    let mut datacenters = previous.datacenters.clone();

    for template in specs {
        let before = previous.datacenters.get(&template.name);
        let observation = observations.get(&template.name);
        let fact = facts.get(&template.name);

        let tracked = before.is_some()
            || matches!(observation, Some(Observation::Found(_)))
            || fact.is_some_and(|f| f.created);
        if !tracked {
            continue;
        }

        let mut entry = before.cloned().unwrap_or_else(|| DatacenterStatusEntry {
            k8s_context: template.k8s_context.clone(),
            ..Default::default()
        });

        match observation {
            Some(Observation::Found(dc)) => {
                let status = dc.status.clone().unwrap_or_default();
                entry.k8s_context = template.k8s_context.clone();
                entry.conditions = condition_snapshot(&status.conditions);
                entry.generation = dc.metadata.generation;
                entry.observed_generation = status.observed_generation;
                entry.ready_once |= entry_ready(&entry) == ConditionStatus::True;
            }
            // Tracked but gone: whatever it reported before no longer holds
            Some(Observation::NotFound) => {
                entry.conditions = condition_snapshot(&[]);
                entry.generation = None;
                entry.observed_generation = None;
            }
            // Unreadable keeps the last snapshot instead of guessing
            Some(Observation::Unreadable(_)) | None => {
                entry.conditions = condition_snapshot(&entry.conditions);
            }
        }

        if let Some(fact) = fact {
            if let Some(injected) = fact.sidecar_injected {
                entry.sidecar_injected = injected;
            }
            if let Some(backup) = &fact.standalone_backup {
                entry.standalone_backup = backup.clone();
            }
            if let Some(rebuild) = &fact.rebuild {
                entry.rebuild = rebuild.clone();
            }
        }

        datacenters.insert(template.name.clone(), entry);
    }

    let tracked: Vec<(&str, ConditionStatus)> = specs
        .iter()
        .filter_map(|t| datacenters.get(&t.name).map(|e| (t.name.as_str(), entry_ready(e))))
        .collect();
    let not_ready: Vec<&str> = tracked
        .iter()
        .filter(|(_, status)| *status != ConditionStatus::True)
        .map(|(name, _)| *name)
        .collect();
    let ready = !tracked.is_empty() && not_ready.is_empty();

    let (value, reason, message) = if tracked.is_empty() {
        (
            ConditionStatus::False,
            REASON_NO_DATACENTERS,
            Some("no datacenter has been created yet".to_string()),
        )
    } else if ready {
        (ConditionStatus::True, REASON_ALL_READY, None)
    } else {
        (
            ConditionStatus::False,
            REASON_NOT_READY,
            Some(format!("not ready: {}", not_ready.join(", "))),
        )
    };
    let mut condition = DatacenterCondition::new(CONDITION_READY, value);
    condition.reason = Some(reason.to_string());
    condition.message = message;

    DatabaseClusterStatus {
        datacenters,
        ready,
        conditions: vec![transition(&previous.conditions, condition, now)],
        error: None,
        observed_generation,
    }
}

/// Status for a spec that cannot converge until it is edited
///
/// Datacenter entries are left untouched; nothing was observed.
pub fn configuration_error(
    previous: Option<&DatabaseClusterStatus>,
    message: &str,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> DatabaseClusterStatus {
    let mut status = previous.cloned().unwrap_or_default();
    let mut condition = DatacenterCondition::new(CONDITION_READY, ConditionStatus::False);
    condition.reason = Some(REASON_CONFIGURATION_ERROR.to_string());
    condition.message = Some(message.to_string());

    // A changed message is a new transition even when the status stays False
    let same = status
        .conditions
        .iter()
        .any(|c| {
            c.type_ == CONDITION_READY
                && c.status == ConditionStatus::False
                && c.message == condition.message
        });
    condition.last_transition_time = if same {
        find_condition(&status.conditions, CONDITION_READY).and_then(|c| c.last_transition_time)
    } else {
        Some(now)
    };

    status.ready = false;
    status.error = Some(message.to_string());
    status.conditions = vec![condition];
    status.observed_generation = observed_generation;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{datacenter_template, observed_datacenter};
    use chrono::TimeZone;

    fn specs() -> Vec<DatacenterTemplate> {
        vec![datacenter_template("dc1", "east"), datacenter_template("dc2", "west")]
    }

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().unwrap()
    }

    fn observations(entries: Vec<(&str, Observation)>) -> Observations {
        entries.into_iter().map(|(n, o)| (n.to_string(), o)).collect()
    }

    #[test]
    fn test_both_ready_reports_two_ready_entries() {
        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", observed_datacenter("dc2", true, true)),
        ]);
        let status = aggregate(&specs(), None, &obs, &Facts::new(), Some(1), t(10));

        assert_eq!(status.datacenters.len(), 2);
        for entry in status.datacenters.values() {
            assert_eq!(entry_ready(entry), ConditionStatus::True);
            assert!(entry.ready_once);
        }
        assert!(status.ready);
        assert_eq!(status.conditions[0].reason.as_deref(), Some(REASON_ALL_READY));
    }

    #[test]
    fn test_uncreated_datacenter_is_absent_and_not_counted() {
        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", Observation::NotFound),
        ]);
        let status = aggregate(&specs(), None, &obs, &Facts::new(), None, t(10));
        assert_eq!(status.datacenters.keys().collect::<Vec<_>>(), vec!["dc1"]);
        assert!(status.ready);
    }

    #[test]
    fn test_missing_ready_condition_is_unknown_not_false() {
        let obs = observations(vec![("dc1", Observation::NotFound)]);
        let facts = Facts::from([(
            "dc1".to_string(),
            LocalFacts {
                created: true,
                sidecar_injected: Some(true),
                ..Default::default()
            },
        )]);
        let status = aggregate(&specs(), None, &obs, &facts, None, t(10));
        let entry = &status.datacenters["dc1"];
        assert_eq!(entry_ready(entry), ConditionStatus::Unknown);
        assert!(entry.sidecar_injected);
        assert_eq!(entry.k8s_context, "east");
        assert!(!status.ready);
    }

    #[test]
    fn test_unreadable_keeps_previous_snapshot() {
        let obs = observations(vec![("dc1", observed_datacenter("dc1", true, true))]);
        let first = aggregate(&specs(), None, &obs, &Facts::new(), None, t(10));

        let obs = observations(vec![("dc1", Observation::Unreadable("timeout".to_string()))]);
        let second = aggregate(&specs(), Some(&first), &obs, &Facts::new(), None, t(20));
        assert_eq!(second.datacenters, first.datacenters);
    }

    #[test]
    fn test_vanished_datacenter_drops_to_unknown() {
        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", observed_datacenter("dc2", true, true)),
        ]);
        let first = aggregate(&specs(), None, &obs, &Facts::new(), None, t(10));
        assert!(first.ready);

        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", Observation::NotFound),
        ]);
        let second = aggregate(&specs(), Some(&first), &obs, &Facts::new(), None, t(20));
        let dc2 = &second.datacenters["dc2"];
        assert_eq!(entry_ready(dc2), ConditionStatus::Unknown);
        assert_eq!(dc2.generation, None);
        assert!(dc2.ready_once, "history is kept");
        assert!(!second.ready);
        assert_eq!(second.conditions[0].message.as_deref(), Some("not ready: dc2"));
    }

    #[test]
    fn test_not_ready_datacenter_blocks_cluster_ready() {
        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", observed_datacenter("dc2", false, true)),
        ]);
        let status = aggregate(&specs(), None, &obs, &Facts::new(), None, t(10));
        assert!(!status.ready);
        assert_eq!(status.conditions[0].message.as_deref(), Some("not ready: dc2"));
    }

    #[test]
    fn test_no_tracked_datacenters_is_not_ready() {
        let status = aggregate(&specs(), None, &Observations::new(), &Facts::new(), None, t(10));
        assert!(!status.ready);
        assert!(status.datacenters.is_empty());
        assert_eq!(status.conditions[0].reason.as_deref(), Some(REASON_NO_DATACENTERS));
    }

    #[test]
    fn test_aggregate_is_stable_across_passes() {
        let obs = observations(vec![("dc1", observed_datacenter("dc1", true, true))]);
        let first = aggregate(&specs(), None, &obs, &Facts::new(), Some(1), t(10));
        let second = aggregate(&specs(), Some(&first), &obs, &Facts::new(), Some(1), t(99));
        assert_eq!(first, second);
    }

    #[test]
    fn test_removed_datacenter_entry_is_retained() {
        let obs = observations(vec![
            ("dc1", observed_datacenter("dc1", true, true)),
            ("dc2", observed_datacenter("dc2", true, true)),
        ]);
        let first = aggregate(&specs(), None, &obs, &Facts::new(), None, t(10));
        let second = aggregate(&specs()[..1], Some(&first), &obs, &Facts::new(), None, t(20));
        assert!(second.datacenters.contains_key("dc2"));
    }

    #[test]
    fn test_configuration_error_surfaces_and_halts_readiness() {
        let obs = observations(vec![("dc1", observed_datacenter("dc1", true, true))]);
        let healthy = aggregate(&specs(), None, &obs, &Facts::new(), Some(1), t(10));

        let message = "duplicate datacenter name dc1";
        let status = configuration_error(Some(&healthy), message, Some(2), t(20));
        assert!(!status.ready);
        assert_eq!(status.error.as_deref(), Some(message));
        assert_eq!(status.conditions[0].reason.as_deref(), Some(REASON_CONFIGURATION_ERROR));
        assert_eq!(status.datacenters, healthy.datacenters);

        let again = configuration_error(Some(&status), message, Some(2), t(30));
        assert_eq!(again, status);
    }
}
