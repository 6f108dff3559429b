//! Cluster object store abstraction
//!
//! The synchronizer and the aggregator never talk to the API server
//! directly. They go through [`ClusterStore`] for objects and Policies, and
//! through [`SignalSink`] for status signals. Two implementations exist:
//! - `kube_store.rs` - kube-rs client against a real cluster
//! - `memory.rs` - in-memory store recording every mutating call

pub mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, StoreCalls};

use crate::models::{Policy, PolicyStatus, StatusSignal};
use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

/// Errors raised by a [`ClusterStore`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict writing {0}")]
    Conflict(String),

    #[error("mapping not found for {kind}, the CRD may not be deployed")]
    NotMapped { kind: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("API error: {0}")]
    Api(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Api(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Classify a kube error raised while operating on `subject`
    pub fn from_kube(subject: impl Into<String>, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                StoreError::NotFound(subject.into())
            }
            kube::Error::Api(response) if response.code == 409 => {
                StoreError::Conflict(subject.into())
            }
            kube::Error::Api(response) if response.code == 400 || response.code == 422 => {
                StoreError::InvalidInput(response.message.clone())
            }
            kube::Error::SerdeError(_) => StoreError::InvalidInput(err.to_string()),
            _ => StoreError::Api(err),
        }
    }
}

/// A resolved API mapping for a kind
#[derive(Debug, Clone)]
pub struct ResourceMapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl ResourceMapping {
    pub fn new(resource: ApiResource, namespaced: bool) -> Self {
        Self {
            resource,
            namespaced,
        }
    }

    /// Namespace to address, empty for cluster-scoped kinds
    pub fn scope_namespace<'a>(&self, namespace: &'a str) -> &'a str {
        if self.namespaced { namespace } else { "" }
    }
}

/// Object store for one cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Resolve the API mapping for a kind
    ///
    /// Returns [`StoreError::NotMapped`] when the kind is not served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, StoreError>;

    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    async fn create(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replace an object; conflicts on a stale resourceVersion
    async fn update(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Merge-patch the status subresource of an object
    async fn patch_status(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<Policy>, StoreError>;

    /// Write a Policy's status, guarded by the Policy's resourceVersion
    async fn update_policy_status(
        &self,
        policy: &Policy,
        status: &PolicyStatus,
    ) -> Result<(), StoreError>;

    /// All status signals visible in a namespace
    async fn list_signals(&self, namespace: &str) -> Result<Vec<StatusSignal>, StoreError>;
}

/// Destination for status signals
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn emit(&self, signal: &StatusSignal) -> Result<(), StoreError>;
}

/// Merge patch body replacing a Policy's status
///
/// Unknown compliance and empty details are written as explicit nulls so a
/// merge patch clears them instead of leaving the previous value behind.
pub fn policy_status_patch(
    resource_version: Option<&str>,
    status: &PolicyStatus,
) -> Result<serde_json::Value, StoreError> {
    let mut body = serde_json::to_value(status)?;
    if let Some(fields) = body.as_object_mut() {
        fields
            .entry("compliant")
            .or_insert(serde_json::Value::Null);
        fields.entry("details").or_insert(serde_json::json!([]));
    }

    let mut patch = serde_json::json!({ "status": body });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// Apply an RFC 7386 JSON merge patch in place
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(
                    target_fields
                        .entry(key.clone())
                        .or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComplianceState, DetailsPerTemplate, TemplateMeta};
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Conflict("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(
            !StoreError::NotMapped {
                kind: "FooPolicy".into()
            }
            .is_transient()
        );
        assert!(!StoreError::InvalidInput("x".into()).is_transient());
    }

    #[test]
    fn test_status_patch_clears_unknown_fields() {
        let patch = policy_status_patch(Some("42"), &PolicyStatus::default()).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert!(patch["status"]["compliant"].is_null());
        assert_eq!(patch["status"]["details"], json!([]));
    }

    #[test]
    fn test_status_patch_keeps_known_fields() {
        let status = PolicyStatus {
            compliant: ComplianceState::Compliant,
            details: vec![DetailsPerTemplate {
                template_meta: TemplateMeta {
                    name: "t".to_string(),
                },
                compliant: ComplianceState::Compliant,
                history: vec![],
            }],
        };
        let patch = policy_status_patch(None, &status).unwrap();
        assert!(patch.get("metadata").is_none());
        assert_eq!(patch["status"]["compliant"], "Compliant");
        assert_eq!(patch["status"]["details"][0]["templateMeta"]["name"], "t");
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"status": {"compliant": "NonCompliant", "keep": 1}});
        merge_patch(&mut target, &json!({"status": {"compliant": null, "new": "x"}}));
        assert_eq!(target, json!({"status": {"keep": 1, "new": "x"}}));

        let mut target = json!("scalar");
        merge_patch(&mut target, &json!({"a": {"b": 1}}));
        assert_eq!(target, json!({"a": {"b": 1}}));
    }
}
