//! Generic in-memory object store shared by every kind in the mock

use crate::error::ContextError;
use crate::key::{ClusterKey, ObjectKind};
use crate::patch::owned_fields_patch;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Objects of one kind, keyed by context, namespace and name
#[derive(Debug)]
pub(crate) struct Store<K> {
    kind: ObjectKind,
    objects: Arc<Mutex<HashMap<ClusterKey, K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Store<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub(crate) fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn peek(&self, key: &ClusterKey) -> Option<K> {
        lock(&self.objects).get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub(crate) fn len_in(&self, context: &str) -> usize {
        lock(&self.objects).keys().filter(|k| k.context == context).count()
    }

    /// Inserts without any API semantics (test seeding)
    pub(crate) fn seed(&self, key: &ClusterKey, mut object: K) {
        stamp_identity(&mut object, key);
        lock(&self.objects).insert(key.clone(), object);
    }

    /// Mutates a stored object in place, returns false when absent
    pub(crate) fn modify(&self, key: &ClusterKey, f: impl FnOnce(&mut K)) -> bool {
        match lock(&self.objects).get_mut(key) {
            Some(object) => {
                f(object);
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, key: &ClusterKey) -> Result<K, ContextError> {
        self.peek(key).ok_or_else(|| self.not_found(key))
    }

    pub(crate) fn create(&self, key: &ClusterKey, object: &K) -> Result<K, ContextError> {
        let mut objects = lock(&self.objects);
        if objects.contains_key(key) {
            return Err(ContextError::AlreadyExists {
                kind: self.kind,
                key: key.clone(),
            });
        }
        let mut created = object.clone();
        stamp_identity(&mut created, key);
        let meta = created.meta_mut();
        meta.generation = Some(1);
        meta.resource_version = Some("1".to_string());
        objects.insert(key.clone(), created.clone());
        Ok(created)
    }

    /// Applies the owned fields of `object`, bumping generation on spec change
    pub(crate) fn patch(&self, key: &ClusterKey, object: &K) -> Result<K, ContextError> {
        let mut objects = lock(&self.objects);
        let existing = objects.get(key).ok_or_else(|| self.not_found(key))?;

        let mut live = serde_json::to_value(existing)?;
        let spec_before = live.get("spec").cloned();
        json_patch::merge(&mut live, &owned_fields_patch(object)?);
        let spec_changed = live.get("spec").cloned() != spec_before;

        let mut patched: K = serde_json::from_value(live)?;
        let meta = patched.meta_mut();
        if spec_changed {
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        }
        let version = meta
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        meta.resource_version = Some((version + 1).to_string());

        objects.insert(key.clone(), patched.clone());
        Ok(patched)
    }

    pub(crate) fn delete(&self, key: &ClusterKey) -> Result<(), ContextError> {
        lock(&self.objects)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| self.not_found(key))
    }

    fn not_found(&self, key: &ClusterKey) -> ContextError {
        ContextError::NotFound {
            kind: self.kind,
            key: key.clone(),
        }
    }
}

fn stamp_identity<K: Resource>(object: &mut K, key: &ClusterKey) {
    let meta = object.meta_mut();
    meta.name = Some(key.name.clone());
    meta.namespace = Some(key.namespace.clone());
}
