//! Compliance derivation from merged history

use crate::models::{ComplianceHistory, ComplianceState, DetailsPerTemplate};

/// State of a template from its newest history entry
///
/// An empty history leaves the template unknown.
pub fn template_state(history: &[ComplianceHistory]) -> ComplianceState {
    history
        .first()
        .map(|entry| ComplianceState::from_message(&entry.message))
        .unwrap_or_default()
}

/// Overall Policy compliance from per-template states
///
/// NonCompliant dominates, then Pending or unknown, then Compliant. A
/// Policy without templates is unknown.
pub fn overall<I>(states: I) -> ComplianceState
where
    I: IntoIterator<Item = ComplianceState>,
{
    let mut any = false;
    let mut undecided = false;
    for state in states {
        any = true;
        match state {
            ComplianceState::NonCompliant => return ComplianceState::NonCompliant,
            ComplianceState::Pending | ComplianceState::Unknown => undecided = true,
            ComplianceState::Compliant => {}
        }
    }

    match (any, undecided) {
        (false, _) => ComplianceState::Unknown,
        (true, true) => ComplianceState::Pending,
        (true, false) => ComplianceState::Compliant,
    }
}

pub fn overall_of(details: &[DetailsPerTemplate]) -> ComplianceState {
    overall(details.iter().map(|d| d.compliant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComplianceState::*;

    #[test]
    fn test_template_state_from_newest_entry() {
        let entry = |message: &str| ComplianceHistory {
            last_timestamp: chrono::Utc::now(),
            message: message.to_string(),
            event_name: "p.1".to_string(),
            event_time: None,
        };

        assert_eq!(template_state(&[]), Unknown);
        assert_eq!(
            template_state(&[entry("(combined from similar events): compliant; ok"), entry("NonCompliant; x")]),
            Compliant
        );
        assert_eq!(template_state(&[entry("Pending; waiting")]), Pending);
        assert_eq!(template_state(&[entry("something else")]), NonCompliant);
    }

    #[test]
    fn test_dominance_order() {
        assert_eq!(overall([Compliant, Compliant]), Compliant);
        assert_eq!(overall([Compliant, Pending]), Pending);
        assert_eq!(overall([Unknown, Compliant]), Pending);
        assert_eq!(overall([Pending, NonCompliant, Unknown]), NonCompliant);
        assert_eq!(overall(Vec::new()), Unknown);
    }
}
