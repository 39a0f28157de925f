//! Helper functions for common reconciliation patterns
//!
//! Every remote object the controller owns goes through the same
//! get / compare / create-or-patch sequence. This module keeps that sequence
//! in one place so each step only has to describe its desired object.

use context_client::{ClusterKey, ContextError, ObjectKind};
use crds::DatabaseClusterStatus;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, info, warn};

/// Result of ensuring a remote object
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured<T> {
    Created(T),
    Updated(T),
    Unchanged(T),
}

impl<T> Ensured<T> {
    pub fn into_inner(self) -> T {
        match self {
            Ensured::Created(t) | Ensured::Updated(t) | Ensured::Unchanged(t) => t,
        }
    }
}

/// Generic create-or-update pattern
///
/// 1. Fetch the object at `key`
/// 2. If it is missing, create it; a create that loses the race against
///    another writer re-reads the object and continues with step 3
/// 3. If it exists, patch it when `needs_update_fn` reports drift
/// 4. Any other error is returned for the caller to record and retry
///
/// The create and patch futures are only awaited when needed.
pub async fn ensure_object<T, G, FGet, FCreate, FPatch, FNeedsUpdate>(
    kind: ObjectKind,
    key: &ClusterKey,
    get_fn: G,
    needs_update_fn: FNeedsUpdate,
    create_fn: FCreate,
    patch_fn: FPatch,
) -> Result<Ensured<T>, ContextError>
where
    G: Fn() -> FGet,
    FGet: Future<Output = Result<T, ContextError>> + Send,
    FCreate: Future<Output = Result<T, ContextError>> + Send,
    FPatch: Future<Output = Result<T, ContextError>> + Send,
    FNeedsUpdate: Fn(&T) -> bool,
{
    let existing = match get_fn().await {
        Ok(existing) => existing,
        Err(e) if e.is_not_found() => {
            info!("Creating {} {}", kind, key);
            match create_fn.await {
                Ok(created) => return Ok(Ensured::Created(created)),
                Err(ContextError::AlreadyExists { .. }) => {
                    debug!("{} {} was created concurrently, re-reading", kind, key);
                    get_fn().await?
                }
                Err(e) => return Err(e),
            }
        }
        Err(e) => {
            warn!("Failed to read {} {}: {}, will retry", kind, key, e);
            return Err(e);
        }
    };

    if needs_update_fn(&existing) {
        info!("{} {} drifted from desired state, updating", kind, key);
        patch_fn.await.map(Ensured::Updated)
    } else {
        debug!("{} {} already up-to-date", kind, key);
        Ok(Ensured::Unchanged(existing))
    }
}

/// Whether any desired label or annotation is missing or different
pub fn metadata_drifted(
    current: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    desired
        .iter()
        .any(|(k, v)| current.and_then(|c| c.get(k)) != Some(v))
}

/// Check if the cluster status needs updating
///
/// Writing an identical status would only bump the resourceVersion and
/// retrigger the controller, so the patch is skipped when nothing changed.
pub fn status_needs_update(
    current: Option<&DatabaseClusterStatus>,
    desired: &DatabaseClusterStatus,
) -> bool {
    match current {
        None => true,
        Some(status) => status != desired,
    }
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod reconcile_helpers_test;
