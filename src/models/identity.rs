//! Object identity
//!
//! A value type naming one object in a cluster by group, version, kind,
//! namespace and name. Used as a watch key by the dependency watcher and as a
//! map key everywhere a set of watched objects is tracked.

use kube::core::GroupVersionKind;
use std::fmt;

/// Identity of a single object watched on behalf of an owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build an identity from a `group/version` (or bare `version`) string
    pub fn from_api_version(
        api_version: &str,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(group, version, kind, namespace, name)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// The `apiVersion` string as it appears on the wire
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Returns the first required field that is empty, if any
    ///
    /// Namespace is optional (cluster-scoped objects).
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.version.is_empty() {
            Some("version")
        } else if self.kind.is_empty() {
            Some("kind")
        } else if self.name.is_empty() {
            Some("name")
        } else {
            None
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version(), self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version(),
                self.kind,
                self.namespace,
                self.name
            )
        }
    }
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(
            split_api_version("policy.open-cluster-management.io/v1"),
            ("policy.open-cluster-management.io", "v1")
        );
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn test_api_version_round_trip_for_core_group() {
        let id = ObjectIdentity::from_api_version("v1", "ConfigMap", "default", "cm");
        assert_eq!(id.api_version(), "v1");
        assert_eq!(id.group, "");
    }

    #[test]
    fn test_missing_field() {
        let id = ObjectIdentity::new("g", "v1", "Kind", "", "");
        assert_eq!(id.missing_field(), Some("name"));

        let id = ObjectIdentity::new("g", "v1", "Kind", "", "name");
        assert_eq!(id.missing_field(), None);
    }

    #[test]
    fn test_display() {
        let id = ObjectIdentity::new("g.io", "v1", "FooPolicy", "ns", "foo");
        assert_eq!(id.to_string(), "g.io/v1/FooPolicy ns/foo");
    }
}
