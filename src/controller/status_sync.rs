//! Compliance history controller
//!
//! Reconciles a Policy whenever the Policy itself or an Event about it
//! changes in the managed cluster namespace.

use super::{ControllerSettings, ReconcileError, Shutdown, error_policy};
use crate::history::HistoryAggregator;
use crate::models::Policy;
use crate::models::registry::POLICY_GROUP;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;

pub struct StatusSyncContext {
    pub aggregator: HistoryAggregator,
    pub settings: ControllerSettings,
    pub shutdown: Shutdown,
}

/// Policy an Event is about, if any
pub fn policy_for_event(event: &Event) -> Option<ObjectRef<Policy>> {
    let involved = &event.involved_object;
    if involved.kind.as_deref() != Some("Policy") {
        return None;
    }
    let in_group = involved
        .api_version
        .as_deref()
        .is_some_and(|api_version| api_version.starts_with(&format!("{}/", POLICY_GROUP)));
    if !in_group {
        return None;
    }

    let name = involved.name.as_deref().filter(|name| !name.is_empty())?;
    let namespace = involved
        .namespace
        .clone()
        .or_else(|| event.namespace())
        .unwrap_or_default();
    Some(ObjectRef::new(name).within(&namespace))
}

async fn reconcile(policy: Arc<Policy>, ctx: Arc<StatusSyncContext>) -> Result<Action, ReconcileError> {
    if ctx.shutdown.is_cancelled() {
        return Ok(Action::await_change());
    }

    match ctx.aggregator.reconcile(&policy).await {
        Ok(aggregation) => {
            tracing::debug!(
                policy = %policy.key(),
                compliant = %aggregation.status.compliant,
                "Aggregated compliance history"
            );
            Ok(Action::await_change())
        }
        Err(e) if e.is_transient() => Err(ReconcileError::StatusSync(e)),
        Err(e) if e.is_not_found() => {
            tracing::debug!(policy = %policy.key(), "Policy gone before status update: {}", e);
            Ok(Action::await_change())
        }
        Err(e) => {
            tracing::warn!(policy = %policy.key(), "Status sync failed: {}", e);
            Ok(Action::requeue(ctx.settings.error_requeue))
        }
    }
}

pub async fn run(client: Client, namespace: &str, ctx: Arc<StatusSyncContext>) {
    let policies = Api::<Policy>::namespaced(client.clone(), namespace);
    let events = Api::<Event>::namespaced(client, namespace);

    let mut shutdown = ctx.shutdown.clone();
    let config = controller::Config::default().concurrency(ctx.settings.concurrency);
    tracing::info!(namespace = %namespace, concurrency = ctx.settings.concurrency, "Starting status sync controller");

    Controller::new(policies, watcher::Config::default())
        .with_config(config)
        .watches(events, watcher::Config::default(), |event| policy_for_event(&event))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => tracing::debug!(policy = %object.name, "Status sync reconciled"),
                Err(e) => tracing::debug!("Status sync controller error: {}", e),
            }
        })
        .await;

    tracing::info!("Status sync controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use kube::core::ObjectMeta;

    fn event(kind: &str, api_version: &str, namespace: Option<&str>) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some("p.17b".to_string()),
                namespace: Some("cluster1".to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(api_version.to_string()),
                kind: Some(kind.to_string()),
                name: Some("p".to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_event_maps_to_policy() {
        let reference =
            policy_for_event(&event("Policy", "policy.open-cluster-management.io/v1", None)).unwrap();
        assert_eq!(reference.name, "p");
        assert_eq!(reference.namespace.as_deref(), Some("cluster1"));
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        assert!(policy_for_event(&event("Pod", "v1", Some("cluster1"))).is_none());
        assert!(policy_for_event(&event("Policy", "example.com/v1", Some("cluster1"))).is_none());
    }
}
