//! Template synchronizer
//!
//! Expands a Policy's template list into child objects. Each template is
//! decoded, gated on its merged dependency set, and then created, updated,
//! left alone or deleted. Errors on one template never stop its siblings;
//! the caller derives a retry decision from the returned [`SyncReport`].
//!
//! Status messages about a template (pending, template errors) go through
//! the [`ResultRelay`] so a replayed reconcile does not emit them twice.

pub mod child;
pub mod dependencies;
pub mod outcome;

pub use child::ClusterLabels;
pub use dependencies::{DependencyConflict, DependencySet};
pub use outcome::{ChildAction, ErrorClass, Outcome, Retry, SyncReport, TemplateError, TemplateOutcome};

use crate::controller::Shutdown;
use crate::models::raw_object::recover_name;
use crate::models::signal::{is_template_error, template_error_message};
use crate::models::{
    ObjectIdentity, Policy, PolicyKey, PolicyTemplate, RawObject, SignalType, StatusSignal,
    registry,
};
use crate::relay::ResultRelay;
use crate::store::{ClusterStore, ResourceMapping, SignalSink, StoreError};
use crate::watcher::{DependencyCache, UninstallGate};
use kube::ResourceExt;
use kube::core::DynamicObject;
use std::sync::Arc;

/// A message to attach to a template after it was processed
struct Notice {
    message: String,
    event_type: SignalType,
}

/// Result of processing one decodable template
struct Processed {
    outcome: Outcome,
    notice: Option<Notice>,
}

impl Processed {
    fn quiet(outcome: Outcome) -> Self {
        Self {
            outcome,
            notice: None,
        }
    }
}

pub struct TemplateSynchronizer {
    store: Arc<dyn ClusterStore>,
    sink: Arc<dyn SignalSink>,
    cache: Arc<dyn DependencyCache>,
    relay: Arc<ResultRelay<PolicyKey>>,
    uninstall: UninstallGate,
    labels: ClusterLabels,
}

impl TemplateSynchronizer {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        sink: Arc<dyn SignalSink>,
        cache: Arc<dyn DependencyCache>,
        relay: Arc<ResultRelay<PolicyKey>>,
        uninstall: UninstallGate,
        labels: ClusterLabels,
    ) -> Self {
        Self {
            store,
            sink,
            cache,
            relay,
            uninstall,
            labels,
        }
    }

    pub fn relay(&self) -> &Arc<ResultRelay<PolicyKey>> {
        &self.relay
    }

    /// Run one synchronization pass over every template of `policy`
    pub async fn sync(&self, policy: &Policy, shutdown: &Shutdown) -> SyncReport {
        let key = policy.key();
        let mut report = SyncReport::default();

        if self.uninstall.is_uninstalling() {
            tracing::debug!(policy = %key, "Uninstalling, skipping template sync");
            report.uninstalling = true;
            return report;
        }

        if policy.spec.disabled {
            self.remove_children(policy, shutdown, &mut report).await;
            self.deregister(policy).await;
            return report;
        }

        let policy_namespace = policy.namespace().unwrap_or_default();
        let top_level =
            DependencySet::from_declarations(&policy.spec.dependencies, &policy_namespace);
        if let Err(conflict) = &top_level {
            tracing::warn!(
                policy = %key,
                dependency = %conflict.identity,
                "Policy dependencies include conflicting compliance states"
            );
        }

        let owner = policy.identity();
        let mut watched = Vec::new();
        self.cache.start_query_batch(&owner);

        for (index, template) in policy.spec.policy_templates.iter().enumerate() {
            if shutdown.is_cancelled() {
                tracing::debug!(policy = %key, "Shutdown observed, stopping template sync");
                report.cancelled = true;
                break;
            }

            let raw = match RawObject::decode(&template.object_definition) {
                Ok(raw) => raw,
                Err(e) => {
                    let template_name = recover_name(&template.object_definition)
                        .unwrap_or_else(|| format!("template-{}", index));
                    let error = TemplateError::Decode(e.to_string());
                    let outcome = self
                        .finish_errored(policy, &template_name, error)
                        .await;
                    report.outcomes.push(TemplateOutcome {
                        index,
                        template_name,
                        outcome,
                    });
                    continue;
                }
            };

            let template_name = raw.name().to_string();
            let processed = match &top_level {
                Ok(top_level) => {
                    self.process(policy, template, &raw, top_level, &mut watched)
                        .await
                }
                Err(conflict) => Processed::quiet(Outcome::Errored(
                    TemplateError::DependencyConflict {
                        identity: conflict.identity.to_string(),
                    },
                )),
            };

            let outcome = self.finish(policy, &template_name, processed).await;
            tracing::debug!(policy = %key, template = %template_name, "Template processed: {:?}", outcome);
            report.outcomes.push(TemplateOutcome {
                index,
                template_name,
                outcome,
            });
        }

        if let Err(e) = self.cache.end_query_batch(&owner).await {
            tracing::warn!(policy = %key, "Failed to close dependency query batch: {}", e);
        }

        if !report.cancelled {
            let result = if watched.is_empty() {
                self.cache.remove_watcher(&owner).await
            } else {
                self.cache.add_or_update_watcher(&owner, &watched).await
            };
            if let Err(e) = result {
                tracing::warn!(policy = %key, "Failed to update dependency watch: {}", e);
            }
        }

        report
    }

    /// Drop all state kept for a deleted Policy
    pub async fn forget(&self, key: &PolicyKey, owner: &ObjectIdentity) {
        let evicted = self.relay.evict_subject(key);
        if evicted > 0 {
            tracing::debug!(policy = %key, "Evicted {} relay entries", evicted);
        }
        if let Err(e) = self.cache.remove_watcher(owner).await {
            tracing::warn!(policy = %key, "Failed to remove dependency watch: {}", e);
        }
    }

    async fn deregister(&self, policy: &Policy) {
        if let Err(e) = self.cache.remove_watcher(&policy.identity()).await {
            tracing::warn!(policy = %policy.key(), "Failed to remove dependency watch: {}", e);
        }
    }

    /// Gate one decoded template on its dependencies and write its child
    async fn process(
        &self,
        policy: &Policy,
        template: &PolicyTemplate,
        raw: &RawObject,
        top_level: &DependencySet,
        watched: &mut Vec<ObjectIdentity>,
    ) -> Processed {
        let policy_namespace = policy.namespace().unwrap_or_default();

        if raw.contains_template_syntax() && !registry::supports_templates(raw.group(), raw.kind()) {
            return Processed::quiet(Outcome::Errored(TemplateError::TemplatesNotSupported {
                kind: raw.kind().to_string(),
            }));
        }

        let mut merged = top_level.clone();
        if let Err(conflict) = merged.extend(&template.extra_dependencies, &policy_namespace) {
            return Processed::quiet(Outcome::Errored(TemplateError::DependencyConflict {
                identity: conflict.identity.to_string(),
            }));
        }
        for identity in merged.identities() {
            if identity.missing_field().is_none() && !watched.contains(identity) {
                watched.push(identity.clone());
            }
        }

        let owner = policy.identity();
        let failing = dependencies::unsatisfied(self.cache.as_ref(), &owner, &merged).await;

        let mapping = match self.store.resolve(&raw.gvk()).await {
            Ok(mapping) => mapping,
            Err(e) => return Processed::quiet(Outcome::Errored(TemplateError::from_store(e))),
        };

        let desired = match child::build_child(policy, raw, &self.labels, mapping.namespaced)
            .to_dynamic(&mapping.resource)
        {
            Ok(desired) => desired,
            Err(e) => return Processed::quiet(Outcome::Errored(TemplateError::Decode(e.to_string()))),
        };
        let namespace = mapping.scope_namespace(&policy_namespace).to_string();

        let existing = match self.store.get(&mapping, &namespace, raw.name()).await {
            Ok(existing) => existing,
            Err(e) => return Processed::quiet(Outcome::Errored(TemplateError::from_store(e))),
        };

        let explanation = (!failing.is_empty()).then(|| dependencies::pending_explanation(&failing));

        match (explanation, template.ignore_pending) {
            (Some(explanation), false) => {
                self.hold_pending(&mapping, &namespace, raw, existing.is_some(), explanation)
                    .await
            }
            (explanation, _) => {
                let notice = explanation.map(|explanation| Notice {
                    message: format!("Compliant; {}", explanation),
                    event_type: SignalType::Normal,
                });
                let outcome = self
                    .admit(policy, raw, &mapping, existing, desired, notice.as_ref())
                    .await;
                Processed { outcome, notice }
            }
        }
    }

    /// Unsatisfied dependencies: never create, and revoke an existing child
    async fn hold_pending(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        raw: &RawObject,
        exists: bool,
        explanation: String,
    ) -> Processed {
        let mut deleted = false;
        if exists {
            if let Err(e) = self.store.delete(mapping, namespace, raw.name()).await {
                return Processed::quiet(Outcome::Errored(TemplateError::from_store(e)));
            }
            tracing::info!(template = %raw.name(), kind = %raw.kind(), "Deleted child with unsatisfied dependencies");
            deleted = true;
        }

        let message = format!("Pending; {}", explanation);
        Processed {
            outcome: Outcome::Pending {
                message: message.clone(),
                deleted,
            },
            notice: Some(Notice {
                message,
                event_type: SignalType::Warning,
            }),
        }
    }

    /// Dependencies satisfied or ignored: create or update the child
    async fn admit(
        &self,
        policy: &Policy,
        raw: &RawObject,
        mapping: &ResourceMapping,
        existing: Option<DynamicObject>,
        desired: DynamicObject,
        notice: Option<&Notice>,
    ) -> Outcome {
        let notice_text = notice.map(|n| n.message.clone());

        let Some(existing) = existing else {
            return match self.store.create(mapping, &desired).await {
                Ok(_) => {
                    tracing::info!(template = %raw.name(), kind = %raw.kind(), "Created child object");
                    Outcome::Satisfied {
                        action: ChildAction::Created,
                        notice: notice_text,
                    }
                }
                Err(e) => Outcome::Errored(TemplateError::from_store(e)),
            };
        };

        if let Err(e) = child::check_owner(&existing, policy) {
            return Outcome::Errored(e);
        }

        let action = if child::needs_update(&existing, &desired) {
            let updated = child::merge_into_existing(&existing, &desired);
            if let Err(e) = self.store.update(mapping, &updated).await {
                return Outcome::Errored(TemplateError::from_store(e));
            }
            tracing::info!(template = %raw.name(), kind = %raw.kind(), "Updated child object");
            ChildAction::Updated
        } else {
            ChildAction::Unchanged
        };

        let stale_error = policy
            .latest_message(raw.name())
            .is_some_and(is_template_error);
        if stale_error {
            let namespace = existing.namespace().unwrap_or_default();
            let patch = serde_json::json!({ "status": { "compliant": null } });
            match self
                .store
                .patch_status(mapping, &namespace, raw.name(), &patch)
                .await
            {
                Ok(()) => {
                    tracing::debug!(template = %raw.name(), "Cleared child compliance after template error")
                }
                Err(e) => return Outcome::Errored(TemplateError::from_store(e)),
            }
        }

        Outcome::Satisfied {
            action,
            notice: notice_text,
        }
    }

    /// Report the template's notice or error, returning the final outcome
    async fn finish(&self, policy: &Policy, template_name: &str, processed: Processed) -> Outcome {
        if let Outcome::Errored(error) = processed.outcome {
            return self.finish_errored(policy, template_name, error).await;
        }

        if let Some(notice) = processed.notice {
            if let Err(e) = self
                .report(policy, template_name, &notice.message, notice.event_type)
                .await
            {
                return Outcome::Errored(TemplateError::Transient(e));
            }
        }
        processed.outcome
    }

    async fn finish_errored(
        &self,
        policy: &Policy,
        template_name: &str,
        error: TemplateError,
    ) -> Outcome {
        match error.class() {
            ErrorClass::Transient => {
                tracing::debug!(policy = %policy.key(), template = %template_name, "Transient error: {}", error);
            }
            ErrorClass::User => {
                tracing::info!(policy = %policy.key(), template = %template_name, "Template error: {}", error);
            }
            ErrorClass::System => {
                tracing::error!(policy = %policy.key(), template = %template_name, "System error: {}", error);
            }
        }

        if error.class() != ErrorClass::Transient {
            let message = template_error_message(&error);
            if let Err(e) = self
                .report(policy, template_name, &message, SignalType::Warning)
                .await
            {
                tracing::warn!(policy = %policy.key(), template = %template_name, "Failed to report template error: {}", e);
            }
        }
        Outcome::Errored(error)
    }

    /// Emit a template status message at most once
    ///
    /// A message already recorded in the Policy's status needs no signal;
    /// its relay entry is evicted so a later return to it is re-announced.
    async fn report(
        &self,
        policy: &Policy,
        template_name: &str,
        message: &str,
        event_type: SignalType,
    ) -> Result<(), StoreError> {
        let key = policy.key();
        if policy.latest_message(template_name) == Some(message) {
            self.relay.evict_if_recorded(&key, template_name, message);
            return Ok(());
        }

        let sink = Arc::clone(&self.sink);
        let emitted = self
            .relay
            .relay(&key, template_name, message, || async move {
                let signal = StatusSignal::for_template(
                    policy,
                    template_name,
                    message,
                    event_type,
                    chrono::Utc::now(),
                );
                sink.emit(&signal).await
            })
            .await?;
        if emitted {
            tracing::debug!(policy = %key, template = %template_name, "Emitted status signal: {}", message);
        }
        Ok(())
    }

    /// Disabled Policy: remove every child that can still be identified
    async fn remove_children(&self, policy: &Policy, shutdown: &Shutdown, report: &mut SyncReport) {
        let policy_namespace = policy.namespace().unwrap_or_default();
        for (index, template) in policy.spec.policy_templates.iter().enumerate() {
            if shutdown.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let Ok(raw) = RawObject::decode(&template.object_definition) else {
                continue;
            };
            let outcome = match self.store.resolve(&raw.gvk()).await {
                Ok(mapping) => {
                    let namespace = mapping.scope_namespace(&policy_namespace);
                    match self.store.delete(&mapping, namespace, raw.name()).await {
                        Ok(()) => Outcome::Removed,
                        Err(e) => Outcome::Errored(TemplateError::from_store(e)),
                    }
                }
                Err(StoreError::NotMapped { .. }) => Outcome::Removed,
                Err(e) => Outcome::Errored(TemplateError::from_store(e)),
            };
            report.outcomes.push(TemplateOutcome {
                index,
                template_name: raw.name().to_string(),
                outcome,
            });
        }
    }
}
