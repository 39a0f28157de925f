//! Controller settings loaded from the environment.

use crate::error::ControllerError;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REQUEUE_WAITING_SECONDS: u64 = 15;
const DEFAULT_BACKOFF_MIN_SECONDS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECONDS: u64 = 300;
const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;

/// Runtime settings of the cluster controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Explicit kubeconfig path (`KUBECONFIG`)
    pub kubeconfig: Option<PathBuf>,
    /// Context holding DatabaseCluster objects, in-cluster when unset
    pub control_plane_context: Option<String>,
    /// Contexts datacenters may be placed in
    pub data_plane_contexts: Vec<String>,
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    /// Requeue delay while waiting on remote progress
    pub requeue_waiting: Duration,
    pub backoff_min_seconds: u64,
    pub backoff_max_seconds: u64,
    /// Clusters reconciled in parallel
    pub concurrency: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            control_plane_context: None,
            data_plane_contexts: Vec::new(),
            namespace: None,
            requeue_waiting: Duration::from_secs(DEFAULT_REQUEUE_WAITING_SECONDS),
            backoff_min_seconds: DEFAULT_BACKOFF_MIN_SECONDS,
            backoff_max_seconds: DEFAULT_BACKOFF_MAX_SECONDS,
            concurrency: DEFAULT_RECONCILE_CONCURRENCY,
        }
    }
}

impl Settings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_plane_contexts: Vec<String> = non_empty("DATA_PLANE_CONTEXTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if data_plane_contexts.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "DATA_PLANE_CONTEXTS environment variable is required".to_string(),
            ));
        }

        let backoff_min_seconds =
            parse_number(&lookup, "BACKOFF_MIN_SECONDS", DEFAULT_BACKOFF_MIN_SECONDS)?;
        let backoff_max_seconds =
            parse_number(&lookup, "BACKOFF_MAX_SECONDS", DEFAULT_BACKOFF_MAX_SECONDS)?;
        if backoff_max_seconds < backoff_min_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_MAX_SECONDS ({}) must not be lower than BACKOFF_MIN_SECONDS ({})",
                backoff_max_seconds, backoff_min_seconds
            )));
        }

        let concurrency =
            parse_number(&lookup, "RECONCILE_CONCURRENCY", DEFAULT_RECONCILE_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            kubeconfig: non_empty("KUBECONFIG").map(PathBuf::from),
            control_plane_context: non_empty("CONTROL_PLANE_CONTEXT"),
            data_plane_contexts,
            namespace: non_empty("WATCH_NAMESPACE"),
            requeue_waiting: Duration::from_secs(parse_number(
                &lookup,
                "REQUEUE_WAITING_SECONDS",
                DEFAULT_REQUEUE_WAITING_SECONDS,
            )?),
            backoff_min_seconds,
            backoff_max_seconds,
            concurrency,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ControllerError> {
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!(
                "{} must be a non-negative integer, got {:?}",
                name, raw
            ))
        }),
    }
}
