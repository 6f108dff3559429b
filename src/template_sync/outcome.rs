//! Per-template results of a synchronization pass

use crate::store::StoreError;
use std::fmt;

/// How an error affects the rest of the reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the whole Policy, no status message
    Transient,
    /// Report on the template, do not retry in a tight loop
    User,
    /// Like `User`, reported distinctly in logs
    System,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to decode the policy template: {0}")]
    Decode(String),

    #[error("Dependencies include conflicting compliance states for {identity}")]
    DependencyConflict { identity: String },

    #[error("Mapping not found, check if the required {kind} CRD is deployed")]
    NotMapped { kind: String },

    #[error("Template name must be unique. Policy template {name} already exists in policy {owner}")]
    NamingConflict { name: String, owner: String },

    #[error("{kind} {name} already exists and is not owned by a policy")]
    AdoptionConflict { kind: String, name: String },

    #[error("Templates are not supported for kind {kind}")]
    TemplatesNotSupported { kind: String },

    #[error("The object was rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Transient(#[source] StoreError),

    #[error("{0}")]
    System(String),
}

impl TemplateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TemplateError::Transient(_) => ErrorClass::Transient,
            TemplateError::System(_) => ErrorClass::System,
            _ => ErrorClass::User,
        }
    }

    /// Classify a store error raised while handling a child object
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotMapped { kind } => TemplateError::NotMapped { kind },
            StoreError::InvalidInput(message) => TemplateError::Rejected(message),
            StoreError::Serialization(e) => TemplateError::Decode(e.to_string()),
            other => TemplateError::Transient(other),
        }
    }
}

/// What happened to an admitted template's child object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug)]
pub enum Outcome {
    /// Dependencies satisfied (or ignored) and the child is in place
    ///
    /// `notice` carries the pending explanation of an `ignorePending` template.
    Satisfied {
        action: ChildAction,
        notice: Option<String>,
    },
    /// Dependencies not satisfied; an existing child was deleted
    Pending { message: String, deleted: bool },
    /// The Policy is disabled and the child was removed if present
    Removed,
    Errored(TemplateError),
}

impl Outcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Outcome::Satisfied { .. })
    }

    pub fn error(&self) -> Option<&TemplateError> {
        match self {
            Outcome::Errored(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct TemplateOutcome {
    pub index: usize,
    pub template_name: String,
    pub outcome: Outcome,
}

impl fmt::Display for TemplateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Satisfied { action, .. } => {
                write!(f, "{}: {:?}", self.template_name, action)
            }
            Outcome::Pending { deleted, .. } => {
                write!(f, "{}: pending (deleted: {})", self.template_name, deleted)
            }
            Outcome::Removed => write!(f, "{}: removed", self.template_name),
            Outcome::Errored(e) => write!(f, "{}: {}", self.template_name, e),
        }
    }
}

/// Retry decision derived from a whole pass
#[derive(Debug, PartialEq, Eq)]
pub enum Retry<'a> {
    /// Requeue with backoff, carrying the last transient error
    Backoff(&'a TemplateError),
    /// Only user or system errors; requeue after the error interval
    Later,
    /// Nothing to do until something changes
    AwaitChange,
}

impl PartialEq for TemplateError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string() && self.class() == other.class()
    }
}

impl Eq for TemplateError {}

/// Result list of one synchronization pass over a Policy
#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<TemplateOutcome>,
    /// Shutdown was observed before every template was processed
    pub cancelled: bool,
    /// The uninstall gate was set and nothing was touched
    pub uninstalling: bool,
}

impl SyncReport {
    pub fn errors(&self) -> impl Iterator<Item = (&TemplateOutcome, &TemplateError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.outcome.error().map(|e| (o, e)))
    }

    /// The last error of the pass, in template order
    pub fn last_error(&self) -> Option<&TemplateError> {
        self.errors().last().map(|(_, e)| e)
    }

    pub fn last_transient_error(&self) -> Option<&TemplateError> {
        self.errors()
            .filter(|(_, e)| e.class() == ErrorClass::Transient)
            .last()
            .map(|(_, e)| e)
    }

    pub fn retry(&self) -> Retry<'_> {
        if let Some(e) = self.last_transient_error() {
            Retry::Backoff(e)
        } else if self.errors().next().is_some() {
            Retry::Later
        } else {
            Retry::AwaitChange
        }
    }

    pub fn outcome(&self, template_name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.template_name == template_name)
            .map(|o| &o.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, outcome: Outcome) -> TemplateOutcome {
        TemplateOutcome {
            index,
            template_name: format!("t{}", index),
            outcome,
        }
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            TemplateError::from_store(StoreError::NotMapped {
                kind: "FooPolicy".into()
            })
            .class(),
            ErrorClass::User
        );
        assert_eq!(
            TemplateError::from_store(StoreError::Conflict("x".into())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TemplateError::System("client".into()).class(),
            ErrorClass::System
        );
    }

    #[test]
    fn test_retry_prefers_last_transient_error() {
        let report = SyncReport {
            outcomes: vec![
                outcome(0, Outcome::Errored(TemplateError::Transient(StoreError::Conflict("a".into())))),
                outcome(1, Outcome::Errored(TemplateError::Decode("bad".into()))),
                outcome(2, Outcome::Errored(TemplateError::Transient(StoreError::Conflict("c".into())))),
                outcome(3, Outcome::Satisfied { action: ChildAction::Created, notice: None }),
            ],
            ..Default::default()
        };

        match report.retry() {
            Retry::Backoff(e) => assert_eq!(e.to_string(), "conflict writing c"),
            other => panic!("unexpected retry decision: {:?}", other),
        }
        assert!(matches!(report.last_error(), Some(TemplateError::Transient(_))));
    }

    #[test]
    fn test_retry_for_user_errors_only() {
        let report = SyncReport {
            outcomes: vec![
                outcome(0, Outcome::Errored(TemplateError::Decode("bad".into()))),
                outcome(1, Outcome::Satisfied { action: ChildAction::Unchanged, notice: None }),
            ],
            ..Default::default()
        };
        assert_eq!(report.retry(), Retry::Later);
    }

    #[test]
    fn test_retry_when_all_satisfied() {
        let report = SyncReport {
            outcomes: vec![outcome(0, Outcome::Pending { message: "Pending; x".into(), deleted: false })],
            ..Default::default()
        };
        assert_eq!(report.retry(), Retry::AwaitChange);
        assert!(report.outcome("t0").is_some());
    }
}
