//! History merging
//!
//! Turns the previously persisted history of a template plus newly observed
//! signals into the bounded, newest-first list that gets persisted next.

use crate::models::ComplianceHistory;
use crate::models::signal::event_name_suffix;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Entries kept per template
pub const MAX_HISTORY: usize = 10;

/// Union of two histories without duplicating an entry already present
///
/// Entries are identified by `(lastTimestamp, eventName)`.
pub fn union(
    previous: &[ComplianceHistory],
    observed: impl IntoIterator<Item = ComplianceHistory>,
) -> Vec<ComplianceHistory> {
    let mut seen: HashSet<(i64, u32, String)> = HashSet::new();
    let mut merged = Vec::with_capacity(previous.len());

    for entry in previous.iter().cloned().chain(observed) {
        let identity = (
            entry.last_timestamp.timestamp(),
            entry.last_timestamp.timestamp_subsec_nanos(),
            entry.event_name.clone(),
        );
        if seen.insert(identity) {
            merged.push(entry);
        }
    }
    merged
}

/// Sort key of an entry; larger keys are newer
///
/// `Option` ranks an absent `eventTime` or an unparseable suffix below any
/// present value, and the event name settles whatever is left, so the key
/// is a total order even when only some entries carry an `eventTime`.
fn recency_key(
    entry: &ComplianceHistory,
) -> (DateTime<Utc>, Option<DateTime<Utc>>, Option<u64>, &str) {
    (
        entry.last_timestamp,
        entry.event_time,
        event_name_suffix(&entry.event_name),
        entry.event_name.as_str(),
    )
}

/// Newest-first ordering with deterministic tie-breaks
///
/// Equal timestamps compare by `eventTime`, then by the hex nanosecond
/// suffix of the event name, then by the event name itself. An entry
/// lacking `eventTime` or a parseable suffix sorts after its peers that
/// have one.
pub fn newest_first(a: &ComplianceHistory, b: &ComplianceHistory) -> Ordering {
    recency_key(b).cmp(&recency_key(a))
}

/// Log same-second neighbours that only the event name could order
fn log_ambiguous_ties(history: &[ComplianceHistory]) {
    for pair in history.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let unresolved = a.last_timestamp == b.last_timestamp
            && a.event_time == b.event_time
            && (event_name_suffix(&a.event_name).is_none()
                || event_name_suffix(&b.event_name).is_none());
        if unresolved {
            tracing::debug!(
                first = %a.event_name,
                second = %b.event_name,
                "History entries with equal timestamps ordered by event name"
            );
        }
    }
}

/// Collapse runs of consecutive entries sharing event name and message
///
/// The first entry of each run is kept.
pub fn collapse_runs(history: &mut Vec<ComplianceHistory>) {
    history.dedup_by(|later, earlier| {
        later.event_name == earlier.event_name && later.message == earlier.message
    });
}

/// Merge previous and newly observed history into the persisted form
pub fn merge_history(
    previous: &[ComplianceHistory],
    observed: impl IntoIterator<Item = ComplianceHistory>,
) -> Vec<ComplianceHistory> {
    let mut merged = union(previous, observed);
    merged.sort_by(newest_first);
    log_ambiguous_ties(&merged);
    collapse_runs(&mut merged);
    merged.truncate(MAX_HISTORY);
    merged
}
