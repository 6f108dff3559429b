//! Dependency resolution and consistency check
//!
//! A template's effective dependency set is the Policy's dependencies
//! followed by the template's extra dependencies. The first declaration of
//! an identity wins; a later declaration of the same identity asking for a
//! different compliance is a conflict.

use crate::models::{ComplianceState, ObjectIdentity, PolicyDependency};
use crate::watcher::{CacheError, DependencyCache, observed_compliance};
use std::collections::HashMap;

/// Two declarations of one identity disagree on the desired compliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyConflict {
    pub identity: ObjectIdentity,
    pub first: ComplianceState,
    pub second: ComplianceState,
}

/// Ordered identity -> desired compliance map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencySet {
    order: Vec<ObjectIdentity>,
    desired: HashMap<ObjectIdentity, ComplianceState>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from declarations, failing on the first disagreement
    pub fn from_declarations(
        declarations: &[PolicyDependency],
        policy_namespace: &str,
    ) -> Result<Self, DependencyConflict> {
        let mut set = Self::new();
        set.extend(declarations, policy_namespace)?;
        Ok(set)
    }

    pub fn insert(
        &mut self,
        identity: ObjectIdentity,
        desired: ComplianceState,
    ) -> Result<(), DependencyConflict> {
        match self.desired.get(&identity) {
            Some(existing) if *existing == desired => Ok(()),
            Some(existing) => Err(DependencyConflict {
                identity,
                first: *existing,
                second: desired,
            }),
            None => {
                self.order.push(identity.clone());
                self.desired.insert(identity, desired);
                Ok(())
            }
        }
    }

    pub fn extend(
        &mut self,
        declarations: &[PolicyDependency],
        policy_namespace: &str,
    ) -> Result<(), DependencyConflict> {
        for declaration in declarations {
            self.insert(declaration.identity(policy_namespace), declaration.compliance)?;
        }
        Ok(())
    }

    /// Entries in first-declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectIdentity, ComplianceState)> {
        self.order
            .iter()
            .filter_map(|identity| self.desired.get(identity).map(|d| (identity, *d)))
    }

    pub fn identities(&self) -> impl Iterator<Item = &ObjectIdentity> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Dependencies of `set` that are not in their desired state
///
/// A lookup failure, a missing object, an absent compliance field and a
/// different compliance all count as unsatisfied.
pub async fn unsatisfied(
    cache: &dyn DependencyCache,
    owner: &ObjectIdentity,
    set: &DependencySet,
) -> Vec<ObjectIdentity> {
    let mut failing = Vec::new();
    for (identity, desired) in set.iter() {
        let observed = match cache.get(owner, identity).await {
            Ok(Some(object)) => observed_compliance(&object).map(str::to_string),
            Ok(None) => None,
            Err(CacheError::InvalidInput(reason)) => {
                tracing::debug!(dependency = %identity, "Invalid dependency: {}", reason);
                None
            }
            Err(e) => {
                tracing::debug!(dependency = %identity, "Dependency lookup failed: {}", e);
                None
            }
        };

        if observed.as_deref() != Some(desired.as_str()) {
            failing.push(identity.clone());
        }
    }
    failing
}

/// Human-readable explanation of failing dependencies
///
/// `Dependencies were not satisfied: 1 is still pending (FooPolicy foo)`
pub fn pending_explanation(failing: &[ObjectIdentity]) -> String {
    let listed = failing
        .iter()
        .map(|identity| format!("{} {}", identity.kind, identity.name))
        .collect::<Vec<_>>()
        .join(", ");
    let verb = if failing.len() == 1 { "is" } else { "are" };
    format!(
        "Dependencies were not satisfied: {} {} still pending ({})",
        failing.len(),
        verb,
        listed
    )
}
