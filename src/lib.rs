//! Policy sync library
//!
//! Keeps a replicated Policy and its child objects consistent on a managed
//! cluster, and folds asynchronous status signals back into the Policy's
//! compliance status on both the managed cluster and the hub.
//!
//! The binary wires these pieces to real clusters; everything below
//! [`store`] can also run against the in-memory store for testing.

pub mod cli;
pub mod config;
pub mod controller;
pub mod history;
pub mod kube;
pub mod models;
pub mod relay;
pub mod store;
pub mod template_sync;
pub mod watcher;

// Re-export commonly used types for convenience
pub use controller::{Shutdown, ShutdownTrigger};
pub use history::{Aggregation, HistoryAggregator};
pub use models::{ComplianceState, Policy, PolicyKey, PolicyStatus, StatusSignal};
pub use relay::ResultRelay;
pub use store::{ClusterStore, KubeStore, MemoryStore, SignalSink, StoreError};
pub use template_sync::{ClusterLabels, Outcome, SyncReport, TemplateSynchronizer};
pub use watcher::{DependencyCache, DependencyWatcher, UninstallGate};
