//! Compliance history aggregator
//!
//! Status signals are the only input. Each pass lists the signals in the
//! Policy's namespace, attributes them to templates by the reason string,
//! merges them into the history carried over from the previous status,
//! and derives per-template and overall compliance. The result is written
//! to the managed Policy and to its hub copy, each only when it changed.

pub mod merge;
pub mod rollup;

pub use merge::{MAX_HISTORY, merge_history};
pub use rollup::{overall, overall_of, template_state};

use crate::models::raw_object::recover_name;
use crate::models::{
    ComplianceHistory, ComplianceState, DetailsPerTemplate, Policy, PolicyKey, PolicyStatus,
    RawObject, StatusSignal, TemplateMeta,
};
use crate::relay::ResultRelay;
use crate::store::{ClusterStore, StoreError};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;

/// What one aggregation pass wrote
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub status: PolicyStatus,
    pub managed_updated: bool,
    pub hub_updated: bool,
}

pub struct HistoryAggregator {
    managed: Arc<dyn ClusterStore>,
    hub: Arc<dyn ClusterStore>,
    hub_namespace: String,
    relay: Option<Arc<ResultRelay<PolicyKey>>>,
}

impl HistoryAggregator {
    pub fn new(
        managed: Arc<dyn ClusterStore>,
        hub: Arc<dyn ClusterStore>,
        hub_namespace: impl Into<String>,
    ) -> Self {
        Self {
            managed,
            hub,
            hub_namespace: hub_namespace.into(),
            relay: None,
        }
    }

    /// Evict relay entries once the persisted status records their message
    pub fn with_relay(mut self, relay: Arc<ResultRelay<PolicyKey>>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Run one aggregation pass for `policy`
    pub async fn reconcile(&self, policy: &Policy) -> Result<Aggregation, StoreError> {
        let key = policy.key();
        let signals = self.managed.list_signals(&key.namespace).await?;
        let observed = attribute(policy, &signals);

        let previous = policy.status_or_default();
        let status = aggregate(policy, &previous, &observed);

        let managed_updated = if status != previous {
            self.managed.update_policy_status(policy, &status).await?;
            tracing::info!(policy = %key, compliant = %status.compliant, "Updated policy status");
            true
        } else {
            false
        };

        let hub_updated = self.update_hub(policy, &status).await?;
        self.evict_recorded(&key, &status);

        Ok(Aggregation {
            status,
            managed_updated,
            hub_updated,
        })
    }

    async fn update_hub(&self, policy: &Policy, status: &PolicyStatus) -> Result<bool, StoreError> {
        let name = policy.name_any();
        let Some(hub_policy) = self.hub.get_policy(&self.hub_namespace, &name).await? else {
            tracing::debug!(policy = %name, namespace = %self.hub_namespace, "Hub policy not found, skipping hub status");
            return Ok(false);
        };

        if hub_policy.status_or_default() == *status {
            return Ok(false);
        }
        self.hub.update_policy_status(&hub_policy, status).await?;
        tracing::debug!(policy = %name, namespace = %self.hub_namespace, "Updated hub policy status");
        Ok(true)
    }

    fn evict_recorded(&self, key: &PolicyKey, status: &PolicyStatus) {
        let Some(relay) = &self.relay else {
            return;
        };
        for detail in &status.details {
            if let Some(latest) = detail.history.first() {
                relay.evict_if_recorded(key, &detail.template_meta.name, &latest.message);
            }
        }
    }
}

/// Group the signals about `policy` by the template named in their reason
pub fn attribute(policy: &Policy, signals: &[StatusSignal]) -> HashMap<String, Vec<ComplianceHistory>> {
    let mut grouped: HashMap<String, Vec<ComplianceHistory>> = HashMap::new();
    for signal in signals.iter().filter(|s| s.is_about(policy)) {
        if let Some(template) = signal.template_name() {
            grouped
                .entry(template.to_string())
                .or_default()
                .push(signal.to_history());
        }
    }
    grouped
}

/// Compute the next status from the previous one and the observed history
///
/// Every template gets a slot, positional to the template list. A template
/// whose definition does not decode is always NonCompliant.
pub fn aggregate(
    policy: &Policy,
    previous: &PolicyStatus,
    observed: &HashMap<String, Vec<ComplianceHistory>>,
) -> PolicyStatus {
    let details: Vec<DetailsPerTemplate> = policy
        .spec
        .policy_templates
        .iter()
        .enumerate()
        .map(|(index, template)| {
            let (name, decoded) = match RawObject::decode(&template.object_definition) {
                Ok(raw) => (raw.name().to_string(), true),
                Err(_) => (
                    recover_name(&template.object_definition)
                        .unwrap_or_else(|| format!("template-{}", index)),
                    false,
                ),
            };

            let carried = previous
                .template(&name)
                .map(|d| d.history.as_slice())
                .unwrap_or_default();
            let new_entries = observed.get(&name).cloned().unwrap_or_default();
            let history = merge_history(carried, new_entries);

            let compliant = if decoded {
                template_state(&history)
            } else {
                ComplianceState::NonCompliant
            };

            DetailsPerTemplate {
                template_meta: TemplateMeta { name },
                compliant,
                history,
            }
        })
        .collect();

    PolicyStatus {
        compliant: overall_of(&details),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicySpec, PolicyTemplate, SignalType};
    use crate::store::{MemoryStore, MockClusterStore};
    use chrono::{TimeZone, Utc};
    use kube::core::ObjectMeta;
    use serde_json::json;

    fn template(name: &str) -> PolicyTemplate {
        PolicyTemplate {
            object_definition: json!({
                "apiVersion": "policy.open-cluster-management.io/v1",
                "kind": "ConfigurationPolicy",
                "metadata": {"name": name},
                "spec": {}
            }),
            ..Default::default()
        }
    }

    fn policy(namespace: &str, templates: Vec<PolicyTemplate>) -> Policy {
        let mut policy = Policy::new(
            "root.parent",
            PolicySpec {
                policy_templates: templates,
                ..Default::default()
            },
        );
        policy.metadata = ObjectMeta {
            name: Some("root.parent".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        policy
    }

    fn signal(policy: &Policy, template: &str, message: &str, minute: u32) -> StatusSignal {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap();
        StatusSignal::for_template(policy, template, message, SignalType::Normal, at)
    }

    #[test]
    fn test_attribute_filters_other_subjects() {
        let parent = policy("cluster1", vec![template("a")]);
        let other = policy("cluster1", vec![]);
        let mut foreign = signal(&other, "a", "NonCompliant; x", 1);
        foreign.involved.name = "someone-else".to_string();
        let mut bad_reason = signal(&parent, "a", "NonCompliant; y", 2);
        bad_reason.reason = "unrelated".to_string();

        let grouped = attribute(
            &parent,
            &[signal(&parent, "a", "Compliant; ok", 0), foreign, bad_reason],
        );
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["a"].len(), 1);
    }

    #[test]
    fn test_undecodable_template_keeps_a_noncompliant_slot() {
        let broken = PolicyTemplate {
            object_definition: json!({"metadata": {"name": "broken"}}),
            ..Default::default()
        };
        let parent = policy("cluster1", vec![template("a"), broken]);
        let observed = attribute(&parent, &[signal(&parent, "a", "Compliant; ok", 0)]);

        let status = aggregate(&parent, &PolicyStatus::default(), &observed);
        assert_eq!(status.details.len(), 2);
        assert_eq!(status.details[0].compliant, ComplianceState::Compliant);
        assert_eq!(status.details[1].template_meta.name, "broken");
        assert_eq!(status.details[1].compliant, ComplianceState::NonCompliant);
        assert_eq!(status.compliant, ComplianceState::NonCompliant);
    }

    #[test]
    fn test_template_without_signals_is_unknown() {
        let parent = policy("cluster1", vec![template("a"), template("b")]);
        let observed = attribute(&parent, &[signal(&parent, "a", "Compliant; ok", 0)]);

        let status = aggregate(&parent, &PolicyStatus::default(), &observed);
        assert!(status.details[1].compliant.is_unknown());
        assert_eq!(status.compliant, ComplianceState::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_writes_only_on_change() {
        let managed = Arc::new(MemoryStore::new());
        let hub = Arc::new(MemoryStore::new());
        let parent = policy("cluster1", vec![template("a")]);
        managed.put_policy(parent.clone());
        hub.put_policy(policy("hub-ns", vec![template("a")]));
        managed.push_signal(signal(&parent, "a", "Compliant; ok", 0));

        let aggregator = HistoryAggregator::new(managed.clone(), hub.clone(), "hub-ns");
        let current = managed.policy("cluster1", "root.parent").unwrap();
        let first = aggregator.reconcile(&current).await.unwrap();
        assert!(first.managed_updated);
        assert!(first.hub_updated);
        assert_eq!(first.status.compliant, ComplianceState::Compliant);

        let current = managed.policy("cluster1", "root.parent").unwrap();
        let second = aggregator.reconcile(&current).await.unwrap();
        assert!(!second.managed_updated);
        assert!(!second.hub_updated);
        assert_eq!(managed.calls().policy_status_updates, 1);
        assert_eq!(hub.calls().policy_status_updates, 1);
    }

    #[tokio::test]
    async fn test_missing_hub_policy_is_skipped() {
        let managed = Arc::new(MemoryStore::new());
        let parent = policy("cluster1", vec![template("a")]);
        managed.put_policy(parent.clone());

        let mut hub = MockClusterStore::new();
        hub.expect_get_policy().times(1).returning(|_, _| Ok(None));
        hub.expect_update_policy_status().never();

        let aggregator = HistoryAggregator::new(managed.clone(), Arc::new(hub), "hub-ns");
        let current = managed.policy("cluster1", "root.parent").unwrap();
        let aggregation = aggregator.reconcile(&current).await.unwrap();
        assert!(!aggregation.hub_updated);
    }

    #[tokio::test]
    async fn test_managed_conflict_is_returned() {
        let mut managed = MockClusterStore::new();
        managed.expect_list_signals().returning(|_| Ok(vec![]));
        managed
            .expect_update_policy_status()
            .returning(|_, _| Err(StoreError::Conflict("policy".to_string())));
        let hub = MockClusterStore::new();

        let mut parent = policy("cluster1", vec![template("a")]);
        parent.status = Some(PolicyStatus {
            compliant: ComplianceState::NonCompliant,
            details: vec![],
        });

        let aggregator = HistoryAggregator::new(Arc::new(managed), Arc::new(hub), "hub-ns");
        let err = aggregator.reconcile(&parent).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_recorded_messages_are_evicted_from_relay() {
        let managed = Arc::new(MemoryStore::new());
        let parent = policy("cluster1", vec![template("a")]);
        managed.put_policy(parent.clone());
        managed.push_signal(signal(&parent, "a", "Pending; waiting", 0));

        let relay = Arc::new(ResultRelay::new());
        relay.record(&parent.key(), "a", "Pending; waiting");
        let aggregator = HistoryAggregator::new(managed.clone(), managed.clone(), "hub-ns")
            .with_relay(relay.clone());

        let current = managed.policy("cluster1", "root.parent").unwrap();
        aggregator.reconcile(&current).await.unwrap();
        assert!(relay.is_empty());
    }
}
