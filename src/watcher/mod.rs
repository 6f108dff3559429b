//! Dependency watcher
//!
//! Serves dependency lookups for the template synchronizer and re-triggers
//! it when a watched dependency changes.
//!
//! Every owner (a Policy) registers the set of identities it depends on.
//! Each distinct kind and namespace with at least one registration gets one
//! background watch loop that feeds [`ObjectState`]. A change to a
//! registered identity sends the owner into the trigger channel.

mod state;
pub mod uninstall;

pub use state::{ObjectState, observed_compliance};
pub use uninstall::UninstallGate;

use crate::controller::Shutdown;
use crate::models::ObjectIdentity;
use crate::store::{ClusterStore, ResourceMapping, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consecutive watch errors after which the watch is restarted from scratch
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An identity could not be constructed; not retryable
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Store(e) if e.is_transient())
    }
}

/// Object cache with owner-scoped watch registrations
#[async_trait]
pub trait DependencyCache: Send + Sync {
    /// Look up an object on behalf of `owner`
    ///
    /// Inside a query batch the identity is recorded for the owner's next
    /// watch set.
    async fn get(
        &self,
        owner: &ObjectIdentity,
        target: &ObjectIdentity,
    ) -> Result<Option<DynamicObject>, CacheError>;

    /// Begin recording every identity `owner` requests
    fn start_query_batch(&self, owner: &ObjectIdentity);

    /// Replace the owner's watch set with everything requested in the batch
    async fn end_query_batch(&self, owner: &ObjectIdentity) -> Result<(), CacheError>;

    /// Replace the owner's watch set outside of a batch
    async fn add_or_update_watcher(
        &self,
        owner: &ObjectIdentity,
        watched: &[ObjectIdentity],
    ) -> Result<(), CacheError>;

    async fn remove_watcher(&self, owner: &ObjectIdentity) -> Result<(), CacheError>;
}

/// Owner -> watched identities table, shared with the watch loops
#[derive(Clone, Default)]
struct Registrations {
    inner: Arc<RwLock<HashMap<ObjectIdentity, BTreeSet<ObjectIdentity>>>>,
}

impl Registrations {
    fn set(&self, owner: &ObjectIdentity, watched: BTreeSet<ObjectIdentity>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if watched.is_empty() {
            inner.remove(owner);
        } else {
            inner.insert(owner.clone(), watched);
        }
    }

    fn get(&self, owner: &ObjectIdentity) -> Option<BTreeSet<ObjectIdentity>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(owner)
            .cloned()
    }

    fn owners_of(&self, identity: &ObjectIdentity) -> Vec<ObjectIdentity> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, watched)| watched.contains(identity))
            .map(|(owner, _)| owner.clone())
            .collect()
    }

    fn scopes(&self) -> HashSet<WatchKey> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .flatten()
            .map(WatchKey::of)
            .collect()
    }
}

/// One watch loop per kind and namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchKey {
    gvk: GroupVersionKind,
    namespace: String,
}

impl WatchKey {
    fn of(identity: &ObjectIdentity) -> Self {
        Self {
            gvk: identity.gvk(),
            namespace: identity.namespace.clone(),
        }
    }
}

struct WatchLoop {
    handle: JoinHandle<()>,
    synced: Arc<AtomicBool>,
}

impl Drop for WatchLoop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// [`DependencyCache`] backed by kube watch loops
///
/// A detached watcher (no client) starts no loops and reads every lookup
/// through the store.
pub struct DependencyWatcher {
    store: Arc<dyn ClusterStore>,
    client: Option<Client>,
    objects: ObjectState,
    registrations: Registrations,
    batches: Mutex<HashMap<ObjectIdentity, BTreeSet<ObjectIdentity>>>,
    loops: Mutex<HashMap<WatchKey, WatchLoop>>,
    trigger_tx: mpsc::UnboundedSender<ObjectIdentity>,
    shutdown: Shutdown,
}

impl DependencyWatcher {
    /// Create a watcher and the channel its change notifications arrive on
    pub fn new(
        store: Arc<dyn ClusterStore>,
        client: Client,
        shutdown: Shutdown,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectIdentity>) {
        Self::build(store, Some(client), shutdown)
    }

    pub fn detached(
        store: Arc<dyn ClusterStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectIdentity>) {
        Self::build(store, None, Shutdown::never())
    }

    fn build(
        store: Arc<dyn ClusterStore>,
        client: Option<Client>,
        shutdown: Shutdown,
    ) -> (Self, mpsc::UnboundedReceiver<ObjectIdentity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                client,
                objects: ObjectState::new(),
                registrations: Registrations::default(),
                batches: Mutex::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
                trigger_tx: tx,
                shutdown,
            },
            rx,
        )
    }

    /// Identities currently registered for an owner
    pub fn watched(&self, owner: &ObjectIdentity) -> Option<BTreeSet<ObjectIdentity>> {
        self.registrations.get(owner)
    }

    /// Number of running watch loops
    pub fn active_watches(&self) -> usize {
        self.lock_loops().len()
    }

    fn lock_loops(&self) -> MutexGuard<'_, HashMap<WatchKey, WatchLoop>> {
        self.loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_batches(&self) -> MutexGuard<'_, HashMap<ObjectIdentity, BTreeSet<ObjectIdentity>>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_synced(&self, key: &WatchKey) -> bool {
        self.lock_loops()
            .get(key)
            .is_some_and(|l| l.synced.load(Ordering::Acquire))
    }

    fn validate(identity: &ObjectIdentity) -> Result<(), CacheError> {
        match identity.missing_field() {
            Some(field) => Err(CacheError::InvalidInput(format!(
                "{} is missing {}",
                identity, field
            ))),
            None => Ok(()),
        }
    }

    /// Start loops for newly watched scopes and stop loops nobody needs
    async fn sync_loops(&self) {
        let needed = self.registrations.scopes();

        let stale: Vec<(WatchKey, WatchLoop)> = {
            let mut loops = self.lock_loops();
            let keys: Vec<WatchKey> = loops
                .keys()
                .filter(|key| !needed.contains(*key))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| loops.remove(&key).map(|l| (key, l)))
                .collect()
        };
        for (key, stale_loop) in stale {
            drop(stale_loop);
            self.objects
                .remove_scope(&key.gvk.group, &key.gvk.kind, &key.namespace);
            tracing::debug!(kind = %key.gvk.kind, namespace = %key.namespace, "Stopped dependency watch");
        }

        let Some(client) = self.client.clone() else {
            return;
        };

        let missing: Vec<WatchKey> = {
            let loops = self.lock_loops();
            needed
                .into_iter()
                .filter(|key| !loops.contains_key(key))
                .collect()
        };
        for key in missing {
            let mapping = match self.store.resolve(&key.gvk).await {
                Ok(mapping) => mapping,
                Err(e) => {
                    tracing::debug!(kind = %key.gvk.kind, "Not watching dependency kind: {}", e);
                    continue;
                }
            };
            let started = self.install_loop(key.clone(), || {
                self.spawn_loop(client.clone(), &key, mapping)
            });
            if !started {
                tracing::trace!(kind = %key.gvk.kind, namespace = %key.namespace, "Dependency watch already running");
            }
        }
    }

    /// Start a loop for `key` unless one is already installed
    ///
    /// `start` runs under the loops lock and only when the slot is vacant.
    fn install_loop(&self, key: WatchKey, start: impl FnOnce() -> WatchLoop) -> bool {
        match self.lock_loops().entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(start());
                true
            }
        }
    }

    fn spawn_loop(&self, client: Client, key: &WatchKey, mapping: ResourceMapping) -> WatchLoop {
        let namespace = mapping.scope_namespace(&key.namespace).to_string();
        let api: Api<DynamicObject> = if namespace.is_empty() {
            Api::all_with(client, &mapping.resource)
        } else {
            Api::namespaced_with(client, &namespace, &mapping.resource)
        };

        let synced = Arc::new(AtomicBool::new(false));
        let loop_synced = synced.clone();
        let objects = self.objects.clone();
        let registrations = self.registrations.clone();
        let trigger_tx = self.trigger_tx.clone();
        let mut shutdown = self.shutdown.clone();
        let gvk = key.gvk.clone();

        tracing::debug!(kind = %gvk.kind, namespace = %namespace, "Starting dependency watch");

        let handle = tokio::spawn(async move {
            let identity_of = |obj: &DynamicObject| {
                ObjectIdentity::new(
                    &gvk.group,
                    &gvk.version,
                    &gvk.kind,
                    obj.namespace().unwrap_or_default(),
                    obj.name_any(),
                )
            };
            let notify = |identity: &ObjectIdentity| {
                for owner in registrations.owners_of(identity) {
                    // The receiver is gone only during shutdown
                    let _ = trigger_tx.send(owner);
                }
            };

            let mut stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
            let mut error_count = 0u32;
            let mut relisted: Option<HashSet<ObjectIdentity>> = None;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(kind = %gvk.kind, "Dependency watch stopped for shutdown");
                        return;
                    }
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(watcher::Event::Init)) => {
                        error_count = 0;
                        relisted = Some(HashSet::new());
                    }
                    Some(Ok(watcher::Event::InitApply(obj))) => {
                        error_count = 0;
                        let identity = identity_of(&obj);
                        if let Some(seen) = relisted.as_mut() {
                            seen.insert(identity.clone());
                        }
                        objects.upsert(identity, obj);
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        error_count = 0;
                        // Objects deleted while the watch was down
                        if let Some(seen) = relisted.take() {
                            for identity in
                                objects.identities_in_scope(&gvk.group, &gvk.kind, &namespace)
                            {
                                if !seen.contains(&identity) {
                                    objects.remove(&identity);
                                    notify(&identity);
                                }
                            }
                        }
                        loop_synced.store(true, Ordering::Release);
                    }
                    Some(Ok(watcher::Event::Apply(obj))) => {
                        error_count = 0;
                        let identity = identity_of(&obj);
                        objects.upsert(identity.clone(), obj);
                        notify(&identity);
                    }
                    Some(Ok(watcher::Event::Delete(obj))) => {
                        error_count = 0;
                        let identity = identity_of(&obj);
                        objects.remove(&identity);
                        notify(&identity);
                    }
                    Some(Err(e)) => {
                        error_count += 1;
                        if error_count == 1 || error_count.is_multiple_of(10) {
                            tracing::warn!(
                                kind = %gvk.kind,
                                error_count,
                                "Dependency watch error: {}",
                                e
                            );
                        }
                        if error_count >= MAX_CONSECUTIVE_ERRORS {
                            tracing::warn!(
                                kind = %gvk.kind,
                                "Restarting dependency watch after {} consecutive errors",
                                error_count
                            );
                            loop_synced.store(false, Ordering::Release);
                            stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
                            error_count = 0;
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                    None => {
                        tracing::warn!(kind = %gvk.kind, "Dependency watch ended unexpectedly, restarting");
                        loop_synced.store(false, Ordering::Release);
                        stream = Box::pin(watcher(api.clone(), watcher::Config::default()));
                    }
                }
            }
        });

        WatchLoop { handle, synced }
    }
}

impl Drop for DependencyWatcher {
    fn drop(&mut self) {
        self.lock_loops().clear();
    }
}

#[async_trait]
impl DependencyCache for DependencyWatcher {
    async fn get(
        &self,
        owner: &ObjectIdentity,
        target: &ObjectIdentity,
    ) -> Result<Option<DynamicObject>, CacheError> {
        Self::validate(target)?;

        if let Some(batch) = self.lock_batches().get_mut(owner) {
            batch.insert(target.clone());
        }

        // A synced watch holds every object of its scope
        if self.is_synced(&WatchKey::of(target)) {
            return Ok(self.objects.get(target));
        }

        let mapping = self.store.resolve(&target.gvk()).await?;
        let object = self
            .store
            .get(&mapping, &target.namespace, &target.name)
            .await?;
        Ok(object)
    }

    fn start_query_batch(&self, owner: &ObjectIdentity) {
        self.lock_batches().insert(owner.clone(), BTreeSet::new());
    }

    async fn end_query_batch(&self, owner: &ObjectIdentity) -> Result<(), CacheError> {
        let Some(requested) = self.lock_batches().remove(owner) else {
            return Ok(());
        };
        self.registrations.set(owner, requested);
        self.sync_loops().await;
        Ok(())
    }

    async fn add_or_update_watcher(
        &self,
        owner: &ObjectIdentity,
        watched: &[ObjectIdentity],
    ) -> Result<(), CacheError> {
        Self::validate(owner)?;
        for identity in watched {
            Self::validate(identity)?;
        }
        self.registrations
            .set(owner, watched.iter().cloned().collect());
        self.sync_loops().await;
        Ok(())
    }

    async fn remove_watcher(&self, owner: &ObjectIdentity) -> Result<(), CacheError> {
        self.registrations.set(owner, BTreeSet::new());
        self.lock_batches().remove(owner);
        self.sync_loops().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn owner() -> ObjectIdentity {
        ObjectIdentity::new("policy.open-cluster-management.io", "v1", "Policy", "cluster1", "owner")
    }

    fn dependency(name: &str) -> ObjectIdentity {
        ObjectIdentity::new("policy.open-cluster-management.io", "v1", "Policy", "cluster1", name)
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let gvk = dependency("x").gvk();
        store.register_kind(&gvk, "policies", true);
        store.put_object(
            &gvk,
            serde_json::from_value(json!({
                "apiVersion": "policy.open-cluster-management.io/v1",
                "kind": "Policy",
                "metadata": {"name": "upstream", "namespace": "cluster1"},
                "status": {"compliant": "Compliant"}
            }))
            .unwrap(),
        );
        store
    }

    #[tokio::test]
    async fn test_get_reads_through_store_when_detached() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        let found = watcher.get(&owner(), &dependency("upstream")).await.unwrap();
        assert_eq!(
            found.as_ref().and_then(observed_compliance),
            Some("Compliant")
        );
        assert!(watcher.get(&owner(), &dependency("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_identity_is_rejected() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        let err = watcher.get(&owner(), &dependency("")).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidInput(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unmapped_kind_surfaces_store_error() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        let target = ObjectIdentity::new("example.com", "v1", "FooPolicy", "cluster1", "foo");
        let err = watcher.get(&owner(), &target).await.unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::NotMapped { .. })));
    }

    #[tokio::test]
    async fn test_query_batch_replaces_watch_set() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        watcher
            .add_or_update_watcher(&owner(), &[dependency("old")])
            .await
            .unwrap();

        watcher.start_query_batch(&owner());
        watcher.get(&owner(), &dependency("upstream")).await.unwrap();
        watcher.get(&owner(), &dependency("missing")).await.unwrap();
        watcher.end_query_batch(&owner()).await.unwrap();

        let watched = watcher.watched(&owner()).unwrap();
        assert_eq!(watched.len(), 2);
        assert!(watched.contains(&dependency("upstream")));
        assert!(!watched.contains(&dependency("old")));
    }

    #[tokio::test]
    async fn test_remove_watcher() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        watcher
            .add_or_update_watcher(&owner(), &[dependency("upstream")])
            .await
            .unwrap();
        assert!(watcher.watched(&owner()).is_some());

        watcher.remove_watcher(&owner()).await.unwrap();
        assert!(watcher.watched(&owner()).is_none());
        assert_eq!(watcher.active_watches(), 0);
    }

    #[test]
    fn test_owners_of() {
        let registrations = Registrations::default();
        let other = dependency("other-owner");
        registrations.set(&owner(), [dependency("a"), dependency("b")].into_iter().collect());
        registrations.set(&other, [dependency("b")].into_iter().collect());

        assert_eq!(registrations.owners_of(&dependency("a")), vec![owner()]);
        let mut owners = registrations.owners_of(&dependency("b"));
        owners.sort();
        assert_eq!(owners, vec![other, owner()]);
        assert_eq!(registrations.scopes().len(), 1);
    }

    fn idle_loop() -> WatchLoop {
        WatchLoop {
            handle: tokio::spawn(std::future::pending::<()>()),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn wait_finished(handle: &tokio::task::AbortHandle) {
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_racing_passes_start_one_loop_per_scope() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        let key = WatchKey::of(&dependency("upstream"));

        let first = idle_loop();
        let first_abort = first.handle.abort_handle();
        assert!(watcher.install_loop(key.clone(), || first));

        let mut second_abort = None;
        let started = watcher.install_loop(key.clone(), || {
            let second = idle_loop();
            second_abort = Some(second.handle.abort_handle());
            second
        });

        assert!(!started);
        assert!(second_abort.is_none());
        assert_eq!(watcher.active_watches(), 1);
        assert!(!first_abort.is_finished());
    }

    #[tokio::test]
    async fn test_stopped_scope_aborts_its_loop() {
        let (watcher, _rx) = DependencyWatcher::detached(seeded_store());
        let key = WatchKey::of(&dependency("upstream"));
        let running = idle_loop();
        let abort = running.handle.abort_handle();
        watcher.install_loop(key, || running);

        watcher.remove_watcher(&owner()).await.unwrap();

        assert_eq!(watcher.active_watches(), 0);
        wait_finished(&abort).await;
    }
}
