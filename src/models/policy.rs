//! The replicated Policy resource
//!
//! A Policy lives in both the hub and the managed cluster. Its spec carries
//! an ordered list of templates, each embedding a child object definition,
//! plus Policy-level dependencies gating every template.

use super::compliance::PolicyStatus;
use super::dependency::PolicyDependency;
use super::identity::ObjectIdentity;
use super::registry::POLICY_GROUP;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Remediation action a Policy may impose on its templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    #[serde(alias = "Enforce")]
    Enforce,
    #[serde(alias = "Inform")]
    Inform,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::Enforce => "enforce",
            RemediationAction::Inform => "inform",
        }
    }
}

#[derive(CustomResource, Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    shortname = "plc",
    namespaced,
    status = "PolicyStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub disabled: bool,
    /// Overrides each template's own remediation action when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<RemediationAction>,
    #[serde(default, rename = "policy-templates")]
    pub policy_templates: Vec<PolicyTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PolicyDependency>,
}

/// One element of a Policy's template list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplate {
    /// Embedded child object, decoded lazily by the synchronizer
    #[serde(default)]
    pub object_definition: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dependencies: Vec<PolicyDependency>,
    #[serde(default)]
    pub ignore_pending: bool,
}

/// Namespace/name key of a Policy, used to scope shared state per subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Policy {
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Identity of this Policy as an owner of dependency watches
    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity::new(
            POLICY_GROUP,
            "v1",
            "Policy",
            self.namespace().unwrap_or_default(),
            self.name_any(),
        )
    }

    pub fn status_or_default(&self) -> PolicyStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Most recent recorded status message for a template
    pub fn latest_message(&self, template_name: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.latest_message(template_name))
    }
}
