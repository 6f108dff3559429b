//! Template synchronizer controller
//!
//! Reconciles every Policy in the managed cluster namespace. Besides the
//! Policy watch itself, reconciles are triggered by the dependency watcher
//! whenever an object a Policy depends on changes.

use super::{ControllerSettings, ReconcileError, Shutdown, error_policy};
use crate::models::{ObjectIdentity, Policy};
use crate::template_sync::{Retry, SyncReport, TemplateSynchronizer};
use futures::{Stream, StreamExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct TemplateSyncContext {
    pub synchronizer: TemplateSynchronizer,
    pub settings: ControllerSettings,
    pub shutdown: Shutdown,
}

/// Map a dependency owner back to the Policy to reconcile
pub fn policy_ref(owner: &ObjectIdentity) -> Option<ObjectRef<Policy>> {
    if owner.kind != "Policy" || owner.name.is_empty() {
        return None;
    }
    Some(ObjectRef::new(&owner.name).within(&owner.namespace))
}

fn trigger_stream(
    triggers: mpsc::UnboundedReceiver<ObjectIdentity>,
) -> impl Stream<Item = ObjectRef<Policy>> + Send + 'static {
    futures::stream::unfold(triggers, |mut rx| async move {
        rx.recv().await.map(|owner| (owner, rx))
    })
    .filter_map(|owner| async move { policy_ref(&owner) })
}

/// Translate a pass into the controller's requeue decision
pub fn action_for(report: &SyncReport, settings: &ControllerSettings) -> Result<Action, ReconcileError> {
    if report.uninstalling || report.cancelled {
        return Ok(Action::await_change());
    }
    match report.retry() {
        Retry::Backoff(error) => Err(ReconcileError::TemplateSync(error.to_string())),
        Retry::Later => Ok(Action::requeue(settings.error_requeue)),
        Retry::AwaitChange => Ok(Action::await_change()),
    }
}

async fn reconcile(
    policy: Arc<Policy>,
    ctx: Arc<TemplateSyncContext>,
) -> Result<Action, ReconcileError> {
    let report = ctx.synchronizer.sync(&policy, &ctx.shutdown).await;
    for outcome in &report.outcomes {
        tracing::trace!(policy = %policy.key(), "{}", outcome);
    }
    action_for(&report, &ctx.settings)
}

/// Forget relay entries and watches of deleted Policies
async fn watch_deletions(api: Api<Policy>, ctx: Arc<TemplateSyncContext>) {
    let mut shutdown = ctx.shutdown.clone();
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Policy deletion watch stopped");
                return;
            }
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Delete(policy))) => {
                    tracing::info!(policy = %policy.key(), "Policy deleted");
                    ctx.synchronizer.forget(&policy.key(), &policy.identity()).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Policy deletion watch error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                None => return,
            }
        }
    }
}

pub async fn run(
    client: Client,
    namespace: &str,
    ctx: Arc<TemplateSyncContext>,
    triggers: mpsc::UnboundedReceiver<ObjectIdentity>,
) {
    let api = Api::<Policy>::namespaced(client, namespace);
    let deletions = tokio::spawn(watch_deletions(api.clone(), Arc::clone(&ctx)));

    let mut shutdown = ctx.shutdown.clone();
    let config = controller::Config::default().concurrency(ctx.settings.concurrency);
    tracing::info!(namespace = %namespace, concurrency = ctx.settings.concurrency, "Starting template sync controller");

    Controller::new(api, watcher::Config::default())
        .with_config(config)
        .reconcile_on(trigger_stream(triggers))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => tracing::debug!(policy = %object.name, "Template sync reconciled"),
                Err(e) => tracing::debug!("Template sync controller error: {}", e),
            }
        })
        .await;

    deletions.abort();
    tracing::info!("Template sync controller stopped");
}
