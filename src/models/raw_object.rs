//! Decoded template objects
//!
//! A template embeds an arbitrary object definition. The synchronizer only
//! cares about its identity and a handful of fields, so the definition is
//! kept as a JSON map behind explicit accessors: decoding may fail, and any
//! field may be absent.

use super::identity::split_api_version;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Error raised when a template's object definition cannot be used
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("object definition is not an object")]
    NotAnObject,

    #[error("object definition is missing {0}")]
    MissingField(&'static str),

    #[error("field {0} must be a string")]
    NotAString(&'static str),
}

/// A structured view over an embedded object definition
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    fields: Map<String, Value>,
}

impl RawObject {
    /// Decode an object definition, requiring apiVersion, kind and metadata.name
    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let fields = value.as_object().ok_or(DecodeError::NotAnObject)?.clone();
        let object = Self { fields };

        object.required_str(&["apiVersion"], "apiVersion")?;
        object.required_str(&["kind"], "kind")?;
        object.required_str(&["metadata", "name"], "metadata.name")?;

        Ok(object)
    }

    fn required_str(&self, path: &[&str], label: &'static str) -> Result<&str, DecodeError> {
        match self.field(path) {
            None | Some(Value::Null) => Err(DecodeError::MissingField(label)),
            Some(Value::String(s)) if s.is_empty() => Err(DecodeError::MissingField(label)),
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(_) => Err(DecodeError::NotAString(label)),
        }
    }

    fn str_field(&self, path: &[&str]) -> &str {
        self.field(path).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.str_field(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_field(&["kind"])
    }

    pub fn name(&self) -> &str {
        self.str_field(&["metadata", "name"])
    }

    pub fn namespace(&self) -> Option<&str> {
        self.field(&["metadata", "namespace"])
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
    }

    pub fn group(&self) -> &str {
        split_api_version(self.api_version()).0
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = split_api_version(self.api_version());
        GroupVersionKind::gvk(group, version, self.kind())
    }

    /// Look up a nested field by path
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.fields.get(*first)?;
        for segment in rest {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current)
    }

    /// Set a nested field, creating intermediate maps as needed
    ///
    /// Intermediate values that are not maps are replaced.
    pub fn set_field(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.field(&["metadata", "labels"]))
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.field(&["metadata", "annotations"]))
    }

    /// True when the definition contains templating delimiters anywhere
    pub fn contains_template_syntax(&self) -> bool {
        fn walk(value: &Value) -> bool {
            match value {
                Value::String(s) => s.contains("{{"),
                Value::Array(items) => items.iter().any(walk),
                Value::Object(map) => map.iter().any(|(k, v)| k.contains("{{") || walk(v)),
                _ => false,
            }
        }
        self.fields.values().any(walk)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Convert into a typed dynamic object for the given resource
    pub fn to_dynamic(&self, resource: &ApiResource) -> Result<DynamicObject, serde_json::Error> {
        let mut object: DynamicObject = serde_json::from_value(self.as_value())?;
        if object.types.is_none() {
            object.types = Some(kube::core::TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }
        Ok(object)
    }
}

/// Best-effort name recovery for definitions that failed to decode
pub fn recover_name(value: &Value) -> Option<String> {
    value
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_policy() -> Value {
        json!({
            "apiVersion": "policy.open-cluster-management.io/v1",
            "kind": "ConfigurationPolicy",
            "metadata": {
                "name": "example",
                "labels": {"team": "a", "count": 3}
            },
            "spec": {"remediationAction": "inform"}
        })
    }

    #[test]
    fn test_decode_and_accessors() {
        let obj = RawObject::decode(&config_policy()).unwrap();
        assert_eq!(obj.kind(), "ConfigurationPolicy");
        assert_eq!(obj.name(), "example");
        assert_eq!(obj.namespace(), None);
        assert_eq!(obj.group(), "policy.open-cluster-management.io");
        assert_eq!(
            obj.field(&["spec", "remediationAction"]),
            Some(&json!("inform"))
        );
        assert_eq!(obj.field(&["spec", "missing"]), None);
        // Non-string label values are skipped
        assert_eq!(obj.labels().len(), 1);
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            RawObject::decode(&json!("just a string")),
            Err(DecodeError::NotAnObject)
        );
        assert_eq!(
            RawObject::decode(&json!({"apiVersion": "v1", "kind": "ConfigMap"})),
            Err(DecodeError::MissingField("metadata.name"))
        );
        assert_eq!(
            RawObject::decode(&json!({"apiVersion": "v1", "kind": 5, "metadata": {"name": "x"}})),
            Err(DecodeError::NotAString("kind"))
        );
    }

    #[test]
    fn test_set_field_creates_parents() {
        let mut obj = RawObject::decode(&config_policy()).unwrap();
        obj.set_field(&["metadata", "ownerReferences"], json!([]));
        obj.set_field(&["spec", "remediationAction"], json!("enforce"));
        obj.set_field(&["status", "compliant"], json!("Compliant"));

        assert_eq!(
            obj.field(&["spec", "remediationAction"]),
            Some(&json!("enforce"))
        );
        assert_eq!(obj.field(&["status", "compliant"]), Some(&json!("Compliant")));
        assert_eq!(obj.field(&["metadata", "name"]), Some(&json!("example")));
    }

    #[test]
    fn test_template_syntax_detection() {
        let plain = RawObject::decode(&config_policy()).unwrap();
        assert!(!plain.contains_template_syntax());

        let mut templated = config_policy();
        templated["spec"]["data"] = json!(["{{ fromSecret \"a\" \"b\" \"c\" }}"]);
        let templated = RawObject::decode(&templated).unwrap();
        assert!(templated.contains_template_syntax());
    }

    #[test]
    fn test_recover_name() {
        assert_eq!(
            recover_name(&json!({"metadata": {"name": "partial"}})),
            Some("partial".to_string())
        );
        assert_eq!(recover_name(&json!({"metadata": {}})), None);
        assert_eq!(recover_name(&json!(null)), None);
    }

    #[test]
    fn test_to_dynamic() {
        let obj = RawObject::decode(&config_policy()).unwrap();
        let resource = ApiResource::from_gvk_with_plural(&obj.gvk(), "configurationpolicies");
        let dynamic = obj.to_dynamic(&resource).unwrap();
        assert_eq!(dynamic.metadata.name.as_deref(), Some("example"));
        assert_eq!(dynamic.data["spec"]["remediationAction"], "inform");
    }
}
