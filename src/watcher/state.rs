//! Cached dependency objects
//!
//! Tracks the latest observed copy of every watched dependency, fed by the
//! watch loops and read by the dependency cache.

use crate::models::ObjectIdentity;
use kube::core::DynamicObject;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe object cache keyed by identity
#[derive(Clone, Default)]
pub struct ObjectState {
    inner: Arc<RwLock<HashMap<ObjectIdentity, DynamicObject>>>,
}

impl ObjectState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectIdentity, DynamicObject>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectIdentity, DynamicObject>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or update an object
    pub fn upsert(&self, identity: ObjectIdentity, object: DynamicObject) {
        self.write().insert(identity, object);
    }

    pub fn remove(&self, identity: &ObjectIdentity) {
        self.write().remove(identity);
    }

    pub fn get(&self, identity: &ObjectIdentity) -> Option<DynamicObject> {
        self.read().get(identity).cloned()
    }

    /// Drop every object of a kind in a namespace, used when its watch stops
    pub fn remove_scope(&self, group: &str, kind: &str, namespace: &str) {
        self.write().retain(|identity, _| {
            !(identity.group == group && identity.kind == kind && identity.namespace == namespace)
        });
    }

    /// Identities currently cached for a kind in a namespace
    pub fn identities_in_scope(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
    ) -> Vec<ObjectIdentity> {
        self.read()
            .keys()
            .filter(|identity| {
                identity.group == group && identity.kind == kind && identity.namespace == namespace
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Compliance reported in an object's status, if any
pub fn observed_compliance(object: &DynamicObject) -> Option<&str> {
    object
        .data
        .get("status")
        .and_then(|status| status.get("compliant"))
        .and_then(|compliant| compliant.as_str())
        .filter(|compliant| !compliant.is_empty())
}
