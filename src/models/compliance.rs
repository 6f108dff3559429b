//! Compliance states, history entries and the persisted Policy status

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker the event system prepends when it folds repeated events together
pub const COMBINED_EVENTS_MARKER: &str = "(combined from similar events):";

/// Compliance of a template, a dependency or a whole Policy
///
/// `Unknown` serializes as the empty string and means no signal has been
/// observed yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Pending,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl ComplianceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "NonCompliant",
            ComplianceState::Pending => "Pending",
            ComplianceState::Unknown => "",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ComplianceState::Unknown)
    }

    /// Derive a state from a status message
    ///
    /// The combined-events marker and surrounding whitespace are stripped,
    /// then the message is matched case-insensitively on its prefix.
    pub fn from_message(message: &str) -> Self {
        let trimmed = message.trim();
        let trimmed = trimmed
            .strip_prefix(COMBINED_EVENTS_MARKER)
            .unwrap_or(trimmed)
            .trim_start()
            .to_lowercase();

        if trimmed.starts_with("compliant") {
            ComplianceState::Compliant
        } else if trimmed.starts_with("pending") {
            ComplianceState::Pending
        } else {
            ComplianceState::NonCompliant
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Compliant" => Ok(ComplianceState::Compliant),
            "NonCompliant" => Ok(ComplianceState::NonCompliant),
            "Pending" => Ok(ComplianceState::Pending),
            "" => Ok(ComplianceState::Unknown),
            other => Err(format!("unknown compliance state: {}", other)),
        }
    }
}

/// One recorded status signal for a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceHistory {
    #[schemars(with = "String")]
    pub last_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub event_name: String,
    /// Microsecond-precision emission time, when the producer set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TemplateMeta {
    #[serde(default)]
    pub name: String,
}

/// Status of a single template, positional to the Policy's template list
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailsPerTemplate {
    #[serde(default)]
    pub template_meta: TemplateMeta,
    #[serde(default, skip_serializing_if = "ComplianceState::is_unknown")]
    pub compliant: ComplianceState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ComplianceHistory>,
}

/// Persisted status of a Policy in both the hub and the managed store
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "ComplianceState::is_unknown")]
    pub compliant: ComplianceState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DetailsPerTemplate>,
}

impl PolicyStatus {
    /// Status detail for a template by name
    pub fn template(&self, name: &str) -> Option<&DetailsPerTemplate> {
        self.details.iter().find(|d| d.template_meta.name == name)
    }

    /// Most recent recorded message for a template
    pub fn latest_message(&self, name: &str) -> Option<&str> {
        self.template(name)
            .and_then(|d| d.history.first())
            .map(|h| h.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_message_prefixes() {
        assert_eq!(
            ComplianceState::from_message("Compliant; notification - ok"),
            ComplianceState::Compliant
        );
        assert_eq!(
            ComplianceState::from_message("compliant; lower case"),
            ComplianceState::Compliant
        );
        assert_eq!(
            ComplianceState::from_message("Pending; Dependencies were not satisfied"),
            ComplianceState::Pending
        );
        assert_eq!(
            ComplianceState::from_message("NonCompliant; violation"),
            ComplianceState::NonCompliant
        );
        assert_eq!(
            ComplianceState::from_message("something unexpected"),
            ComplianceState::NonCompliant
        );
    }

    #[test]
    fn test_from_message_strips_combined_marker() {
        assert_eq!(
            ComplianceState::from_message("(combined from similar events): Compliant; ok"),
            ComplianceState::Compliant
        );
        assert_eq!(
            ComplianceState::from_message("  (combined from similar events):   Pending; wait"),
            ComplianceState::Pending
        );
    }

    #[test]
    fn test_unknown_serializes_as_empty_string() {
        let json = serde_json::to_string(&ComplianceState::Unknown).unwrap();
        assert_eq!(json, "\"\"");
        let parsed: ComplianceState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, ComplianceState::Unknown);
    }

    #[test]
    fn test_status_shape() {
        let status = PolicyStatus {
            compliant: ComplianceState::NonCompliant,
            details: vec![DetailsPerTemplate {
                template_meta: TemplateMeta {
                    name: "tmpl".to_string(),
                },
                compliant: ComplianceState::NonCompliant,
                history: vec![ComplianceHistory {
                    last_timestamp: "2024-01-01T10:00:00Z".parse().unwrap(),
                    message: "NonCompliant; violation".to_string(),
                    event_name: "policy.17a1b2c3d4e5f607".to_string(),
                    event_time: None,
                }],
            }],
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["compliant"], "NonCompliant");
        assert_eq!(value["details"][0]["templateMeta"]["name"], "tmpl");
        assert_eq!(
            value["details"][0]["history"][0]["eventName"],
            "policy.17a1b2c3d4e5f607"
        );
        assert!(value["details"][0]["history"][0].get("eventTime").is_none());
        assert_eq!(
            status.latest_message("tmpl"),
            Some("NonCompliant; violation")
        );
    }
}
