//! kube-rs backed cluster store
//!
//! Dynamic objects go through `Api<DynamicObject>` with API mappings
//! resolved by discovery and cached for the life of the process. Status
//! signals are core/v1 Events.

use super::{ClusterStore, ResourceMapping, SignalSink, StoreError, policy_status_patch};
use crate::models::{InvolvedObject, Policy, PolicyStatus, SignalType, StatusSignal};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Event;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Component name reported on emitted events
pub const REPORTING_COMPONENT: &str = "policy-sync";

/// [`ClusterStore`] and [`SignalSink`] over a kube client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Instance name reported on emitted events
    reporting_instance: String,
    mappings: Arc<RwLock<HashMap<GroupVersionKind, ResourceMapping>>>,
}

impl KubeStore {
    pub fn new(client: Client, reporting_instance: impl Into<String>) -> Self {
        Self {
            client,
            reporting_instance: reporting_instance.into(),
            mappings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn dynamic_api(&self, mapping: &ResourceMapping, namespace: &str) -> Api<DynamicObject> {
        let namespace = mapping.scope_namespace(namespace);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &mapping.resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &mapping.resource)
        }
    }

    fn cached_mapping(&self, gvk: &GroupVersionKind) -> Option<ResourceMapping> {
        let mappings = self
            .mappings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mappings.get(gvk).cloned()
    }
}

fn subject(mapping: &ResourceMapping, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{} {}", mapping.resource.kind, name)
    } else {
        format!("{} {}/{}", mapping.resource.kind, namespace, name)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceMapping, StoreError> {
        if let Some(mapping) = self.cached_mapping(gvk) {
            return Ok(mapping);
        }

        let (resource, capabilities) = match discovery::pinned_kind(&self.client, gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(_)) => {
                return Err(StoreError::NotMapped {
                    kind: gvk.kind.clone(),
                });
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                return Err(StoreError::NotMapped {
                    kind: gvk.kind.clone(),
                });
            }
            Err(err) => return Err(StoreError::Api(err)),
        };

        let mapping = ResourceMapping::new(resource, capabilities.scope == Scope::Namespaced);
        tracing::debug!(
            kind = %gvk.kind,
            plural = %mapping.resource.plural,
            namespaced = mapping.namespaced,
            "Resolved API mapping"
        );

        self.mappings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(gvk.clone(), mapping.clone());
        Ok(mapping)
    }

    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.dynamic_api(mapping, namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(subject(mapping, namespace, name), e))
    }

    async fn create(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        self.dynamic_api(mapping, &namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(subject(mapping, &namespace, &object.name_any()), e))
    }

    async fn update(
        &self,
        mapping: &ResourceMapping,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        self.dynamic_api(mapping, &namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(subject(mapping, &namespace, &name), e))
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        match self
            .dynamic_api(mapping, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(StoreError::from_kube(subject(mapping, namespace, name), e)),
        }
    }

    async fn patch_status(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), StoreError> {
        self.dynamic_api(mapping, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(subject(mapping, namespace, name), e))
    }

    async fn get_policy(&self, namespace: &str, name: &str) -> Result<Option<Policy>, StoreError> {
        Api::<Policy>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(format!("Policy {}/{}", namespace, name), e))
    }

    async fn update_policy_status(
        &self,
        policy: &Policy,
        status: &PolicyStatus,
    ) -> Result<(), StoreError> {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let patch = policy_status_patch(policy.resource_version().as_deref(), status)?;

        Api::<Policy>::namespaced(self.client.clone(), &namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(format!("Policy {}/{}", namespace, name), e))
    }

    async fn list_signals(&self, namespace: &str) -> Result<Vec<StatusSignal>, StoreError> {
        let events = Api::<Event>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube(format!("Events in {}", namespace), e))?;

        let mut signals = Vec::with_capacity(events.items.len());
        for event in &events.items {
            let value = serde_json::to_value(event)?;
            if let Some(signal) = signal_from_event(&value) {
                signals.push(signal);
            }
        }
        Ok(signals)
    }
}

#[async_trait]
impl SignalSink for KubeStore {
    async fn emit(&self, signal: &StatusSignal) -> Result<(), StoreError> {
        let event: Event =
            serde_json::from_value(event_from_signal(signal, &self.reporting_instance))?;
        Api::<Event>::namespaced(self.client.clone(), &signal.namespace)
            .create(&PostParams::default(), &event)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(format!("Event {}", signal.name), e))
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Convert a serialized core/v1 Event into a status signal
///
/// Events without any usable timestamp are skipped.
pub fn signal_from_event(event: &Value) -> Option<StatusSignal> {
    let text = |path: &[&str]| -> String {
        path.iter()
            .try_fold(event, |value, segment| value.get(*segment))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let event_time = parse_time(event.get("eventTime"));
    let last_timestamp = parse_time(event.get("lastTimestamp"))
        .or(event_time)
        .or_else(|| parse_time(event.get("firstTimestamp")))
        .or_else(|| parse_time(event.pointer("/metadata/creationTimestamp")))?;

    let uid = text(&["involvedObject", "uid"]);
    Some(StatusSignal {
        name: text(&["metadata", "name"]),
        namespace: text(&["metadata", "namespace"]),
        involved: InvolvedObject {
            api_version: text(&["involvedObject", "apiVersion"]),
            kind: text(&["involvedObject", "kind"]),
            namespace: text(&["involvedObject", "namespace"]),
            name: text(&["involvedObject", "name"]),
            uid: (!uid.is_empty()).then_some(uid),
        },
        reason: text(&["reason"]),
        message: text(&["message"]),
        event_type: if text(&["type"]) == "Warning" {
            SignalType::Warning
        } else {
            SignalType::Normal
        },
        last_timestamp,
        event_time,
    })
}

/// Serialize a status signal as a core/v1 Event body
pub fn event_from_signal(signal: &StatusSignal, reporting_instance: &str) -> Value {
    let mut involved = json!({
        "apiVersion": signal.involved.api_version,
        "kind": signal.involved.kind,
        "namespace": signal.involved.namespace,
        "name": signal.involved.name,
    });
    if let Some(uid) = &signal.involved.uid {
        involved["uid"] = json!(uid);
    }

    let last = signal
        .last_timestamp
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut event = json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {
            "name": signal.name,
            "namespace": signal.namespace,
        },
        "involvedObject": involved,
        "reason": signal.reason,
        "message": signal.message,
        "type": signal.event_type.as_str(),
        "count": 1,
        "firstTimestamp": last,
        "lastTimestamp": last,
        "source": { "component": REPORTING_COMPONENT },
        "reportingComponent": REPORTING_COMPONENT,
        "reportingInstance": reporting_instance,
    });
    if let Some(event_time) = signal.event_time {
        event["eventTime"] = json!(event_time.to_rfc3339_opts(SecondsFormat::Micros, true));
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal() -> StatusSignal {
        let at: DateTime<Utc> = "2024-05-01T10:00:00.123456Z".parse().unwrap();
        StatusSignal {
            name: "policy-a.17c0a1b2c3d4e5f6".to_string(),
            namespace: "cluster1".to_string(),
            involved: InvolvedObject {
                api_version: "policy.open-cluster-management.io/v1".to_string(),
                kind: "Policy".to_string(),
                namespace: "cluster1".to_string(),
                name: "policy-a".to_string(),
                uid: Some("abc".to_string()),
            },
            reason: "policy: cluster1/tmpl".to_string(),
            message: "Compliant; notification - ok".to_string(),
            event_type: SignalType::Normal,
            last_timestamp: at,
            event_time: Some(at),
        }
    }

    #[test]
    fn test_event_body_shape() {
        let event = event_from_signal(&sample_signal(), "cluster1");
        assert_eq!(event["metadata"]["name"], "policy-a.17c0a1b2c3d4e5f6");
        assert_eq!(event["involvedObject"]["kind"], "Policy");
        assert_eq!(event["lastTimestamp"], "2024-05-01T10:00:00Z");
        assert_eq!(event["eventTime"], "2024-05-01T10:00:00.123456Z");
        assert_eq!(event["type"], "Normal");
    }

    #[test]
    fn test_signal_from_event_body() {
        let original = sample_signal();
        let signal = signal_from_event(&event_from_signal(&original, "cluster1")).unwrap();
        assert_eq!(signal.involved, original.involved);
        assert_eq!(signal.template_name(), Some("tmpl"));
        assert_eq!(signal.event_time, original.event_time);
        // lastTimestamp is second precision on the wire
        assert_eq!(
            signal.last_timestamp,
            "2024-05-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_signal_without_timestamps_is_skipped() {
        let event = json!({
            "metadata": {"name": "e", "namespace": "ns"},
            "involvedObject": {"kind": "Policy", "name": "p"},
            "reason": "policy: ns/t",
            "message": "Compliant",
        });
        assert!(signal_from_event(&event).is_none());
    }

    #[test]
    fn test_signal_falls_back_to_event_time() {
        let event = json!({
            "metadata": {"name": "e", "namespace": "ns"},
            "involvedObject": {"kind": "Policy", "name": "p"},
            "reason": "policy: ns/t",
            "message": "Compliant",
            "type": "Warning",
            "eventTime": "2024-05-01T10:00:00.000001Z",
        });
        let signal = signal_from_event(&event).unwrap();
        assert_eq!(signal.last_timestamp, signal.event_time.unwrap());
        assert_eq!(signal.event_type, SignalType::Warning);
        assert_eq!(signal.involved.uid, None);
    }
}
