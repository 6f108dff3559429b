//! Dependency declarations
//!
//! A dependency names another object and the compliance it must report
//! before a template is admitted.

use super::compliance::ComplianceState;
use super::identity::{ObjectIdentity, split_api_version};
use super::registry;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDependency {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Compliance the dependency must report
    pub compliance: ComplianceState,
}

impl PolicyDependency {
    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    pub fn version(&self) -> &str {
        split_api_version(&self.api_version).1
    }

    /// Resolve the identity this dependency points at
    ///
    /// A blank namespace on an in-family kind means the Policy's namespace.
    pub fn identity(&self, policy_namespace: &str) -> ObjectIdentity {
        let namespace = if self.namespace.is_empty()
            && registry::defaults_to_policy_namespace(self.group(), &self.kind)
        {
            policy_namespace.to_string()
        } else {
            self.namespace.clone()
        };

        ObjectIdentity::new(
            self.group(),
            self.version(),
            &self.kind,
            namespace,
            &self.name,
        )
    }
}
