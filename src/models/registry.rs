//! Registry of in-family policy kinds
//!
//! Kinds served under the policy API group get two special treatments:
//! a blank dependency namespace defaults to the Policy's own namespace, and
//! only some of them understand templating syntax inside their definition.
//!
//! To add a new kind, add an entry to POLICY_KIND_REGISTRY below.

/// API group shared by the Policy resource and its in-family template kinds
pub const POLICY_GROUP: &str = "policy.open-cluster-management.io";

/// Registry entry for an in-family policy kind
pub struct PolicyKindEntry {
    pub kind: &'static str,
    pub namespaced: bool,
    pub supports_templates: bool,
}

/// Registry of all in-family policy kinds
pub const POLICY_KIND_REGISTRY: &[PolicyKindEntry] = &[
    PolicyKindEntry {
        kind: "Policy",
        namespaced: true,
        supports_templates: false,
    },
    PolicyKindEntry {
        kind: "ConfigurationPolicy",
        namespaced: true,
        supports_templates: true,
    },
    PolicyKindEntry {
        kind: "OperatorPolicy",
        namespaced: true,
        supports_templates: true,
    },
    PolicyKindEntry {
        kind: "CertificatePolicy",
        namespaced: true,
        supports_templates: false,
    },
    PolicyKindEntry {
        kind: "IamPolicy",
        namespaced: true,
        supports_templates: false,
    },
];

/// Look up an entry by group and kind
pub fn lookup(group: &str, kind: &str) -> Option<&'static PolicyKindEntry> {
    if group != POLICY_GROUP {
        return None;
    }
    POLICY_KIND_REGISTRY.iter().find(|entry| entry.kind == kind)
}

/// Whether a blank namespace on a reference to this kind means "the Policy's namespace"
pub fn defaults_to_policy_namespace(group: &str, kind: &str) -> bool {
    lookup(group, kind).is_some_and(|entry| entry.namespaced)
}

/// Whether templating syntax is allowed in objects of this kind
pub fn supports_templates(group: &str, kind: &str) -> bool {
    lookup(group, kind).is_some_and(|entry| entry.supports_templates)
}
