//! Child object construction
//!
//! Turns a decoded template into the object the synchronizer writes: forced
//! into the Policy's namespace, owned by the Policy, labelled with the
//! cluster it runs on, and carrying the Policy's remediation override.

use super::outcome::TemplateError;
use crate::models::{Policy, RawObject};
use kube::ResourceExt;
use kube::core::DynamicObject;
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub const LEGACY_CLUSTER_NAME_LABEL: &str = "cluster-name";
pub const LEGACY_CLUSTER_NAMESPACE_LABEL: &str = "cluster-namespace";
pub const CLUSTER_NAME_LABEL: &str = "policy.open-cluster-management.io/cluster-name";
pub const CLUSTER_NAMESPACE_LABEL: &str = "policy.open-cluster-management.io/cluster-namespace";

/// Identity of the managed cluster stamped onto every child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLabels {
    pub cluster_name: String,
    pub cluster_namespace: String,
}

impl ClusterLabels {
    pub fn new(cluster_name: impl Into<String>, cluster_namespace: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cluster_namespace: cluster_namespace.into(),
        }
    }

    fn apply(&self, labels: &mut BTreeMap<String, String>) {
        for key in [LEGACY_CLUSTER_NAME_LABEL, CLUSTER_NAME_LABEL] {
            labels.insert(key.to_string(), self.cluster_name.clone());
        }
        for key in [LEGACY_CLUSTER_NAMESPACE_LABEL, CLUSTER_NAMESPACE_LABEL] {
            labels.insert(key.to_string(), self.cluster_namespace.clone());
        }
    }
}

/// Owner reference pointing at the Policy
pub fn owner_reference(policy: &Policy) -> Value {
    json!({
        "apiVersion": "policy.open-cluster-management.io/v1",
        "kind": "Policy",
        "name": policy.name_any(),
        "uid": policy.uid().unwrap_or_default(),
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

/// Desired child object for a template
pub fn build_child(
    policy: &Policy,
    template: &RawObject,
    labels: &ClusterLabels,
    namespaced: bool,
) -> RawObject {
    let mut child = template.clone();

    if namespaced {
        let namespace = policy.namespace().unwrap_or_default();
        child.set_field(&["metadata", "namespace"], json!(namespace));
    }
    child.set_field(
        &["metadata", "ownerReferences"],
        json!([owner_reference(policy)]),
    );

    let mut merged = template.labels();
    labels.apply(&mut merged);
    child.set_field(&["metadata", "labels"], json!(merged));

    // Only an explicit Policy-level action overrides the template's own
    if let Some(action) = policy.spec.remediation_action {
        child.set_field(&["spec", "remediationAction"], json!(action.as_str()));
    }

    child
}

fn annotations_of(object: &DynamicObject) -> BTreeMap<String, String> {
    object.metadata.annotations.clone().unwrap_or_default()
}

fn spec_of(object: &DynamicObject) -> &Value {
    object.data.get("spec").unwrap_or(&Value::Null)
}

/// Whether the existing child differs from the desired one
///
/// Only spec and annotations are compared; status and server-populated
/// metadata legitimately diverge.
pub fn needs_update(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    spec_of(existing) != spec_of(desired) || annotations_of(existing) != annotations_of(desired)
}

/// Copy the desired spec, annotations and labels onto the existing object
pub fn merge_into_existing(existing: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut updated = existing.clone();
    updated.data["spec"] = spec_of(desired).clone();
    updated.metadata.annotations = desired.metadata.annotations.clone();

    let mut labels = existing.metadata.labels.clone().unwrap_or_default();
    labels.extend(desired.metadata.labels.clone().unwrap_or_default());
    updated.metadata.labels = Some(labels);
    updated
}

/// Check that an existing child belongs to the Policy claiming its name
pub fn check_owner(existing: &DynamicObject, policy: &Policy) -> Result<(), TemplateError> {
    let owners = existing.owner_references();
    let Some(first) = owners.first() else {
        return Err(TemplateError::AdoptionConflict {
            kind: existing
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_default(),
            name: existing.name_any(),
        });
    };

    let policy_name = policy.name_any();
    let owned_by_policy = owners
        .iter()
        .any(|owner| owner.kind == "Policy" && owner.name == policy_name);
    if owned_by_policy {
        Ok(())
    } else {
        Err(TemplateError::NamingConflict {
            name: existing.name_any(),
            owner: first.name.clone(),
        })
    }
}
