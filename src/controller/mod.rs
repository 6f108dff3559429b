//! Controllers
//!
//! Two `kube::runtime::Controller<Policy>` instances run side by side over
//! the managed cluster namespace:
//! - `template_sync.rs` - writes child objects, re-triggered by dependency changes
//! - `status_sync.rs` - aggregates status signals into the Policy status
//!
//! Both share the [`Shutdown`] handle and the retry conventions below.

pub mod shutdown;
pub mod status_sync;
pub mod template_sync;

pub use shutdown::{Shutdown, ShutdownTrigger, channel};

use crate::models::Policy;
use crate::store::StoreError;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

/// Requeue delay after a transient reconcile failure
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(5);

/// Per-controller tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Maximum reconciles running at once; 0 means unbounded
    pub concurrency: u16,
    /// Requeue delay when only non-retryable errors were reported
    pub error_requeue: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            error_requeue: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Carries the last transient template error of the pass
    #[error("template sync failed: {0}")]
    TemplateSync(String),

    #[error("status sync failed: {0}")]
    StatusSync(#[source] StoreError),
}

/// Shared error policy: log and requeue after a fixed delay
pub fn error_policy<C>(policy: Arc<Policy>, error: &ReconcileError, _ctx: Arc<C>) -> Action {
    tracing::warn!(
        policy = %policy.name_any(),
        namespace = %policy.namespace().unwrap_or_default(),
        "Reconcile failed: {}",
        error
    );
    Action::requeue(TRANSIENT_REQUEUE)
}
