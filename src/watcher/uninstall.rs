//! Uninstall gate
//!
//! When the addon is being removed its Deployment is annotated with
//! `policy.open-cluster-management.io/uninstalling: "true"`. From then on the
//! template synchronizer must stop creating, updating and deleting child
//! objects so the uninstall can clean them up without a fight.

use crate::controller::Shutdown;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

pub const UNINSTALL_ANNOTATION: &str = "policy.open-cluster-management.io/uninstalling";

/// Whether a set of annotations marks the addon as uninstalling
pub fn is_uninstalling(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(UNINSTALL_ANNOTATION)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

/// Snapshot-readable uninstall flag
///
/// Only the watch loop started by [`UninstallGate::spawn_watch`] writes the
/// flag. Readers take a plain snapshot.
#[derive(Clone, Default)]
pub struct UninstallGate {
    flag: Arc<AtomicBool>,
}

impl UninstallGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate in a fixed state with no watch loop
    pub fn fixed(uninstalling: bool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(uninstalling)),
        }
    }

    pub fn is_uninstalling(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn set(&self, uninstalling: bool) {
        let previous = self.flag.swap(uninstalling, Ordering::AcqRel);
        if previous != uninstalling {
            tracing::info!(uninstalling, "Uninstall mode changed");
        }
    }

    /// Watch the addon Deployment and keep the flag in sync with its annotation
    pub fn spawn_watch(
        &self,
        client: Client,
        namespace: &str,
        deployment_name: &str,
        mut shutdown: Shutdown,
    ) -> JoinHandle<()> {
        let gate = self.clone();
        let api: Api<Deployment> = Api::namespaced(client, namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", deployment_name));
        let deployment_name = deployment_name.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api.clone(), config.clone()));
            let mut error_count = 0u32;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(deployment = %deployment_name, "Uninstall watch stopped");
                        return;
                    }
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(watcher::Event::Apply(deployment)))
                    | Some(Ok(watcher::Event::InitApply(deployment))) => {
                        error_count = 0;
                        gate.set(is_uninstalling(deployment.annotations()));
                    }
                    Some(Ok(watcher::Event::Delete(_))) => {
                        error_count = 0;
                    }
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {
                        error_count = 0;
                    }
                    Some(Err(e)) => {
                        error_count += 1;
                        if error_count == 1 || error_count.is_multiple_of(10) {
                            tracing::warn!(
                                deployment = %deployment_name,
                                error_count,
                                "Uninstall watch error: {}",
                                e
                            );
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                    None => {
                        tracing::warn!(
                            deployment = %deployment_name,
                            "Uninstall watch ended unexpectedly, restarting"
                        );
                        stream = Box::pin(watcher(api.clone(), config.clone()));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_detection() {
        let mut annotations = BTreeMap::new();
        assert!(!is_uninstalling(&annotations));

        annotations.insert(UNINSTALL_ANNOTATION.to_string(), "false".to_string());
        assert!(!is_uninstalling(&annotations));

        annotations.insert(UNINSTALL_ANNOTATION.to_string(), "true".to_string());
        assert!(is_uninstalling(&annotations));
    }

    #[test]
    fn test_gate_snapshot() {
        let gate = UninstallGate::new();
        assert!(!gate.is_uninstalling());

        let reader = gate.clone();
        gate.set(true);
        assert!(reader.is_uninstalling());

        assert!(UninstallGate::fixed(true).is_uninstalling());
    }
}
