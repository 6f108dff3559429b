//! Status signals
//!
//! A status signal is the only channel through which compliance reaches the
//! history aggregator. On a real cluster it is a core/v1 Event whose
//! involved object is the Policy and whose reason names the template:
//! `policy: <namespace>/<template>`.

use super::compliance::ComplianceHistory;
use super::policy::Policy;
use super::registry::POLICY_GROUP;
use chrono::{DateTime, SubsecRound, Utc};
use kube::ResourceExt;

/// Marker placed after the compliance prefix of synchronizer error messages
pub const TEMPLATE_ERROR_MARKER: &str = "template-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Normal,
    Warning,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Normal => "Normal",
            SignalType::Warning => "Warning",
        }
    }
}

/// Subject of a signal
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvolvedObject {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSignal {
    /// Event name, `<subject>.<hex unix nanos>` for signals this crate emits
    pub name: String,
    pub namespace: String,
    pub involved: InvolvedObject,
    pub reason: String,
    pub message: String,
    pub event_type: SignalType,
    pub last_timestamp: DateTime<Utc>,
    pub event_time: Option<DateTime<Utc>>,
}

impl StatusSignal {
    /// Build a signal attributing `message` to one template of a Policy
    ///
    /// Timestamps carry the precision the Event API stores: whole seconds for
    /// `lastTimestamp`, microseconds for `eventTime`. The event name keeps the
    /// full nanosecond value.
    pub fn for_template(
        policy: &Policy,
        template_name: &str,
        message: impl Into<String>,
        event_type: SignalType,
        now: DateTime<Utc>,
    ) -> Self {
        let namespace = policy.namespace().unwrap_or_default();
        let policy_name = policy.name_any();
        Self {
            name: event_name(&policy_name, now),
            namespace: namespace.clone(),
            involved: InvolvedObject {
                api_version: format!("{}/v1", POLICY_GROUP),
                kind: "Policy".to_string(),
                namespace: namespace.clone(),
                name: policy_name,
                uid: policy.uid(),
            },
            reason: template_reason(&namespace, template_name),
            message: message.into(),
            event_type,
            last_timestamp: now.trunc_subsecs(0),
            event_time: Some(now.trunc_subsecs(6)),
        }
    }

    /// Template name carried in the reason, if the reason has the expected shape
    pub fn template_name(&self) -> Option<&str> {
        parse_template_reason(&self.reason)
    }

    /// Whether this signal's subject is the given Policy
    pub fn is_about(&self, policy: &Policy) -> bool {
        self.involved.kind == "Policy"
            && self.involved.api_version == format!("{}/v1", POLICY_GROUP)
            && self.involved.name == policy.name_any()
    }

    pub fn to_history(&self) -> ComplianceHistory {
        ComplianceHistory {
            last_timestamp: self.last_timestamp,
            message: self.message.clone(),
            event_name: self.name.clone(),
            event_time: self.event_time,
        }
    }
}

/// Reason string attributing a signal to a template
pub fn template_reason(namespace: &str, template_name: &str) -> String {
    format!("policy: {}/{}", namespace, template_name)
}

/// Extract the template name from a `policy: [<namespace>/]<name>` reason
///
/// The `policy` keyword is case-insensitive and the namespace prefix is
/// optional. A prefix that is not a valid namespace is kept as part of the
/// name.
pub fn parse_template_reason(reason: &str) -> Option<&str> {
    const KEYWORD: &str = "policy:";

    let keyword = reason.get(..KEYWORD.len())?;
    if !keyword.eq_ignore_ascii_case(KEYWORD) {
        return None;
    }
    let rest = reason[KEYWORD.len()..].trim_start();

    let name = match rest.split_once('/') {
        Some((namespace, name)) if is_namespace_like(namespace) => name,
        _ => rest,
    };

    let name = name.trim();
    if name.is_empty() { None } else { Some(name) }
}

fn is_namespace_like(candidate: &str) -> bool {
    // One optional whitespace is tolerated before the separator
    let candidate = candidate
        .strip_suffix(|c: char| c.is_whitespace())
        .unwrap_or(candidate);
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Event name in the `<object>.<hex unix nanos>` form used by event recorders
pub fn event_name(object_name: &str, at: DateTime<Utc>) -> String {
    let nanos = at.timestamp_nanos_opt().unwrap_or_default();
    format!("{}.{:x}", object_name, nanos)
}

/// Parse the hexadecimal nanosecond suffix after the final `.` of an event name
pub fn event_name_suffix(event_name: &str) -> Option<u64> {
    let (_, suffix) = event_name.rsplit_once('.')?;
    u64::from_str_radix(suffix, 16).ok()
}

/// Message reported for a template the synchronizer could not process
pub fn template_error_message(detail: impl std::fmt::Display) -> String {
    format!("NonCompliant; {}; {}", TEMPLATE_ERROR_MARKER, detail)
}

/// Whether a status message records a synchronizer template error
pub fn is_template_error(message: &str) -> bool {
    message
        .split(';')
        .nth(1)
        .is_some_and(|part| part.trim() == TEMPLATE_ERROR_MARKER)
}
