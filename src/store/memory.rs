//! In-memory cluster store
//!
//! Behaves like a single API server: resourceVersions are bumped on every
//! write and stale writes conflict. Every mutating call is counted so tests
//! can assert on side effects.

use super::{ClusterStore, ResourceMapping, SignalSink, StoreError, merge_patch};
use crate::models::{Policy, PolicyStatus, StatusSignal};
use async_trait::async_trait;
use kube::ResourceExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Counts of mutating calls seen by a [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub status_patches: usize,
    pub policy_status_updates: usize,
    pub emitted: usize,
}

impl StoreCalls {
    /// Creates, updates and deletes of child objects
    pub fn object_writes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct Inner {
    mappings: HashMap<GroupVersionKind, ResourceMapping>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    policies: BTreeMap<(String, String), Policy>,
    signals: Vec<StatusSignal>,
    calls: StoreCalls,
    next_version: u64,
}

impl Inner {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn object_key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve a kind; unregistered kinds resolve to `NotMapped`
    pub fn register_kind(&self, gvk: &GroupVersionKind, plural: &str, namespaced: bool) {
        let mapping =
            ResourceMapping::new(ApiResource::from_gvk_with_plural(gvk, plural), namespaced);
        self.lock().mappings.insert(gvk.clone(), mapping);
    }

    /// Seed or overwrite an object without counting a call
    pub fn put_object(&self, gvk: &GroupVersionKind, mut object: DynamicObject) {
        let mut inner = self.lock();
        let Some(mapping) = inner.mappings.get(gvk).cloned() else {
            return;
        };
        let namespace = mapping.scope_namespace(&object.namespace().unwrap_or_default()).to_string();
        let version = inner.bump_version();
        object.metadata.resource_version = Some(version);
        let key = object_key(&mapping.resource, &namespace, &object.name_any());
        inner.objects.insert(key, object);
    }

    pub fn object(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        let inner = self.lock();
        let mapping = inner.mappings.get(gvk)?;
        let key = object_key(&mapping.resource, mapping.scope_namespace(namespace), name);
        inner.objects.get(&key).cloned()
    }

    /// Seed or overwrite a Policy without counting a call
    pub fn put_policy(&self, mut policy: Policy) {
        let mut inner = self.lock();
        policy.metadata.resource_version = Some(inner.bump_version());
        if policy.metadata.uid.is_none() {
            policy.metadata.uid = Some(format!("uid-{}", policy.name_any()));
        }
        let key = (policy.namespace().unwrap_or_default(), policy.name_any());
        inner.policies.insert(key, policy);
    }

    pub fn policy(&self, namespace: &str, name: &str) -> Option<Policy> {
        self.lock()
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Add a signal as if another producer had emitted it
    pub fn push_signal(&self, signal: StatusSignal) {
        self.lock().signals.push(signal);
    }

    pub fn signals(&self) -> Vec<StatusSignal> {
        self.lock().signals.clone()
    }

    pub fn calls(&self) -> StoreCalls {
        self.lock().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.lock().calls = StoreCalls::default();
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, StoreError> {
        self.lock()
            .mappings
            .get(gvk)
            .cloned()
            .ok_or_else(|| StoreError::NotMapped {
                kind: gvk.kind.clone(),
            })
    }

    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let key = object_key(&mapping.resource, mapping.scope_namespace(namespace), name);
        Ok(self.lock().objects.get(&key).cloned())
    }

    async fn create(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        let namespace = object.namespace().unwrap_or_default();
        let key = object_key(
            &mapping.resource,
            mapping.scope_namespace(&namespace),
            &object.name_any(),
        );
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                mapping.resource.kind,
                object.name_any()
            )));
        }

        let mut created = object.clone();
        created.metadata.resource_version = Some(inner.bump_version());
        created.metadata.uid = Some(format!("uid-{}", object.name_any()));
        inner.calls.creates += 1;
        inner.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let key = object_key(&mapping.resource, mapping.scope_namespace(&namespace), &name);

        let Some(current) = inner.objects.get(&key) else {
            return Err(StoreError::NotFound(format!(
                "{} {}",
                mapping.resource.kind, name
            )));
        };
        if object.metadata.resource_version.is_some()
            && object.metadata.resource_version != current.metadata.resource_version
        {
            return Err(StoreError::Conflict(format!(
                "{} {}",
                mapping.resource.kind, name
            )));
        }

        let mut updated = object.clone();
        // Status is a subresource and survives spec updates
        if let Some(status) = current.data.get("status").cloned() {
            updated.data["status"] = status;
        }
        updated.metadata.resource_version = Some(inner.bump_version());
        inner.calls.updates += 1;
        inner.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = object_key(&mapping.resource, mapping.scope_namespace(namespace), name);
        if inner.objects.remove(&key).is_some() {
            inner.calls.deletes += 1;
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = object_key(&mapping.resource, mapping.scope_namespace(namespace), name);
        let version = inner.bump_version();
        let Some(object) = inner.objects.get_mut(&key) else {
            return Err(StoreError::NotFound(format!(
                "{} {}",
                mapping.resource.kind, name
            )));
        };

        if let Some(status_patch) = patch.get("status") {
            let status = object
                .data
                .as_object_mut()
                .map(|fields| fields.entry("status").or_insert(serde_json::Value::Null));
            if let Some(status) = status {
                merge_patch(status, status_patch);
            }
        }
        object.metadata.resource_version = Some(version);
        inner.calls.status_patches += 1;
        Ok(())
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<Policy>, StoreError> {
        Ok(self.policy(namespace, name))
    }

    async fn update_policy_status(
        &self,
        policy: &Policy,
        status: &PolicyStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (policy.namespace().unwrap_or_default(), policy.name_any());
        let version = inner.bump_version();
        let Some(current) = inner.policies.get_mut(&key) else {
            return Err(StoreError::NotFound(format!("Policy {}/{}", key.0, key.1)));
        };
        if policy.metadata.resource_version.is_some()
            && policy.metadata.resource_version != current.metadata.resource_version
        {
            return Err(StoreError::Conflict(format!("Policy {}/{}", key.0, key.1)));
        }

        current.status = Some(status.clone());
        current.metadata.resource_version = Some(version);
        inner.calls.policy_status_updates += 1;
        Ok(())
    }

    async fn list_signals(&self, namespace: &str) -> Result<Vec<StatusSignal>, StoreError> {
        Ok(self
            .lock()
            .signals
            .iter()
            .filter(|signal| signal.namespace == namespace)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SignalSink for MemoryStore {
    async fn emit(&self, signal: &StatusSignal) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.calls.emitted += 1;
        inner.signals.push(signal.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_policy_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(
            "policy.open-cluster-management.io",
            "v1",
            "ConfigurationPolicy",
        )
    }

    fn object(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "policy.open-cluster-management.io/v1",
            "kind": "ConfigurationPolicy",
            "metadata": {"name": name, "namespace": "cluster1"},
            "spec": {"remediationAction": "inform"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_not_mapped() {
        let store = MemoryStore::new();
        let err = store.resolve(&config_policy_gvk()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotMapped { .. }));
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let store = MemoryStore::new();
        let gvk = config_policy_gvk();
        store.register_kind(&gvk, "configurationpolicies", true);
        let mapping = store.resolve(&gvk).await.unwrap();

        let created = store.create(&mapping, &object("a")).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert!(matches!(
            store.create(&mapping, &object("a")).await,
            Err(StoreError::Conflict(_))
        ));

        let mut changed = created.clone();
        changed.data["spec"]["remediationAction"] = json!("enforce");
        store.update(&mapping, &changed).await.unwrap();

        // Stale resourceVersion
        assert!(matches!(
            store.update(&mapping, &changed).await,
            Err(StoreError::Conflict(_))
        ));

        store.delete(&mapping, "cluster1", "a").await.unwrap();
        assert!(store.get(&mapping, "cluster1", "a").await.unwrap().is_none());

        let calls = store.calls();
        assert_eq!(calls.creates, 1);
        assert_eq!(calls.updates, 1);
        assert_eq!(calls.deletes, 1);
    }

    #[tokio::test]
    async fn test_patch_status_merges() {
        let store = MemoryStore::new();
        let gvk = config_policy_gvk();
        store.register_kind(&gvk, "configurationpolicies", true);
        let mut seeded = object("a");
        seeded.data["status"] = json!({"compliant": "NonCompliant", "relatedObjects": []});
        store.put_object(&gvk, seeded);

        let mapping = store.resolve(&gvk).await.unwrap();
        store
            .patch_status(&mapping, "cluster1", "a", &json!({"status": {"compliant": null}}))
            .await
            .unwrap();

        let stored = store.object(&gvk, "cluster1", "a").unwrap();
        assert!(stored.data["status"].get("compliant").is_none());
        assert_eq!(stored.data["status"]["relatedObjects"], json!([]));
        assert_eq!(store.calls().status_patches, 1);
    }
}
