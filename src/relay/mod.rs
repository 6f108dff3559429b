//! Idempotent result relay
//!
//! Producers of status signals may run many times for the same logical
//! fact (reconcile replays, watch redelivery). The relay remembers a digest
//! of the last message emitted per subject and scope and suppresses an
//! identical emission.
//!
//! Entries are evicted once the authoritative record (the Policy status)
//! reflects the message, so a later change that comes back to the same text
//! is announced again. The relay is not persistent: after a restart at most
//! one duplicate emission per subject and scope may happen.

use crate::models::PolicyKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// SHA-256 digest of an emitted message
pub type MessageDigest = [u8; 32];

pub fn digest(message: &str) -> MessageDigest {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// At-most-once emission guard keyed by subject and scope
///
/// The subject is the owning object (a Policy by default); the scope names
/// what within the subject the message is about, such as a template.
pub struct ResultRelay<S = PolicyKey> {
    entries: Mutex<HashMap<S, HashMap<String, MessageDigest>>>,
}

impl<S> Default for ResultRelay<S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> ResultRelay<S>
where
    S: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<S, HashMap<String, MessageDigest>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `message` is the last message recorded for this subject and scope
    pub fn is_duplicate(&self, subject: &S, scope: &str, message: &str) -> bool {
        let candidate = digest(message);
        self.lock()
            .get(subject)
            .and_then(|scopes| scopes.get(scope))
            .is_some_and(|stored| *stored == candidate)
    }

    /// Record `message` as emitted
    pub fn record(&self, subject: &S, scope: &str, message: &str) {
        self.lock()
            .entry(subject.clone())
            .or_default()
            .insert(scope.to_string(), digest(message));
    }

    /// Emit `message` through `emit` unless it was already emitted
    ///
    /// Returns `Ok(true)` when `emit` ran and succeeded. A failed emission is
    /// not recorded, so the next call retries it.
    pub async fn relay<F, Fut, E>(
        &self,
        subject: &S,
        scope: &str,
        message: &str,
        emit: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self.is_duplicate(subject, scope, message) {
            return Ok(false);
        }

        emit().await?;
        self.record(subject, scope, message);
        Ok(true)
    }

    pub fn evict(&self, subject: &S, scope: &str) {
        let mut entries = self.lock();
        if let Some(scopes) = entries.get_mut(subject) {
            scopes.remove(scope);
            if scopes.is_empty() {
                entries.remove(subject);
            }
        }
    }

    /// Evict the entry when the authoritative record shows the same message
    ///
    /// Returns true if an entry was evicted.
    pub fn evict_if_recorded(&self, subject: &S, scope: &str, recorded_message: &str) -> bool {
        if !self.is_duplicate(subject, scope, recorded_message) {
            return false;
        }
        self.evict(subject, scope);
        true
    }

    /// Drop every entry scoped to a deleted subject
    pub fn evict_subject(&self, subject: &S) -> usize {
        self.lock()
            .remove(subject)
            .map(|scopes| scopes.len())
            .unwrap_or(0)
    }

    /// Number of recorded entries across all subjects
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
