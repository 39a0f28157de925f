//! Datacenter Sequencer
//!
//! Decides which datacenters may be created or updated in this pass. Remote
//! datacenters come online strictly in spec order: a datacenter is only
//! created once every datacenter before it is Ready with its latest spec
//! revision observed. Datacenters that already exist are always kept up to
//! date, whatever their neighbours are doing. A datacenter that is about to
//! be patched this pass counts as not settled: its generation moves ahead of
//! what it has observed. The sequencer never deletes.

use super::observe::{Observation, Observations};
use crds::DatacenterTemplate;
use std::collections::BTreeSet;

/// Why a datacenter is not touched this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// Replicated secrets are not in place yet
    PrerequisitesPending,
    /// Its own context could not be read
    Unreadable,
    /// Waiting for the named earlier datacenter to become Ready
    WaitingFor(String),
}

/// Decision for one datacenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// First creation
    Create,
    /// Already exists, reconcile its spec
    Update,
    Deferred(DeferReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Eligibility::Deferred(_))
    }
}

/// Outcome of one sequencing decision over the whole cluster
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencePlan {
    /// Decisions in spec order
    pub decisions: Vec<(String, Eligibility)>,
    /// Something is still converging, look again later
    pub requeue: bool,
}

impl SequencePlan {
    pub fn decision(&self, datacenter: &str) -> Option<&Eligibility> {
        self.decisions
            .iter()
            .find(|(name, _)| name == datacenter)
            .map(|(_, e)| e)
    }

    pub fn is_first_creation(&self, datacenter: &str) -> bool {
        self.decision(datacenter) == Some(&Eligibility::Create)
    }

    /// Eligible datacenter names in spec order
    pub fn eligible(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, e)| e.is_eligible())
            .map(|(name, _)| name.as_str())
    }
}

/// Computes the sequencing plan
///
/// `pending_updates` names existing datacenters whose spec this pass is about
/// to change. A missing observation is treated like NotFound.
pub fn plan(
    specs: &[DatacenterTemplate],
    observations: &Observations,
    pending_updates: &BTreeSet<String>,
    prerequisites_met: bool,
) -> SequencePlan {
    if !prerequisites_met {
        return SequencePlan {
            decisions: specs
                .iter()
                .map(|s| (s.name.clone(), Eligibility::Deferred(DeferReason::PrerequisitesPending)))
                .collect(),
            requeue: true,
        };
    }

    let mut decisions = Vec::with_capacity(specs.len());
    let mut requeue = false;
    // First datacenter that is not settled; closes creation for everyone after it
    let mut blocker: Option<&str> = None;

    for spec in specs {
        let name = spec.name.as_str();
        let decision = match observations.get(name).unwrap_or(&Observation::NotFound) {
            found @ Observation::Found(_) => {
                if !found.is_settled() || pending_updates.contains(name) {
                    requeue = true;
                    blocker.get_or_insert(name);
                }
                Eligibility::Update
            }
            Observation::NotFound => match blocker {
                None => {
                    // The freshly created datacenter cannot be Ready yet
                    requeue = true;
                    blocker = Some(name);
                    Eligibility::Create
                }
                Some(waiting_for) => {
                    Eligibility::Deferred(DeferReason::WaitingFor(waiting_for.to_string()))
                }
            },
            Observation::Unreadable(_) => {
                requeue = true;
                blocker.get_or_insert(name);
                Eligibility::Deferred(DeferReason::Unreadable)
            }
        };
        decisions.push((spec.name.clone(), decision));
    }

    SequencePlan { decisions, requeue }
}
