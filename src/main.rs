//! policy-sync - template synchronizer and compliance history aggregator
//!
//! Runs both controllers against the managed cluster until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use policy_sync::cli::{Args, init_logging};
use policy_sync::config::ConfigLoader;
use policy_sync::controller::status_sync::{self, StatusSyncContext};
use policy_sync::controller::template_sync::{self, TemplateSyncContext};
use policy_sync::controller::{self, ControllerSettings};
use policy_sync::{
    ClusterLabels, DependencyWatcher, HistoryAggregator, KubeStore, ResultRelay,
    TemplateSynchronizer, UninstallGate,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    init_logging(&config.logger, args.debug)?;
    ConfigLoader::validate(&config).context("Invalid configuration")?;

    tracing::info!(
        cluster = %config.cluster_name,
        namespace = %config.cluster_namespace,
        hub_namespace = %config.hub_namespace(),
        "Starting policy-sync"
    );

    let managed = policy_sync::kube::create_client().await?;
    let hub = policy_sync::kube::hub_client(config.hub_kubeconfig.as_deref(), &managed).await?;

    let instance = std::env::var("POD_NAME").unwrap_or_else(|_| config.cluster_name.clone());
    let managed_store = Arc::new(KubeStore::new(managed.clone(), instance.clone()));
    let hub_store = Arc::new(KubeStore::new(hub, instance));

    let (trigger, shutdown) = controller::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            trigger.trigger();
        }
    });

    let uninstall = UninstallGate::new();
    let uninstall_watch = uninstall.spawn_watch(
        managed.clone(),
        &config.controller_namespace,
        &config.deployment_name,
        shutdown.clone(),
    );

    let (cache, triggers) =
        DependencyWatcher::new(managed_store.clone(), managed.clone(), shutdown.clone());
    let relay = Arc::new(ResultRelay::new());

    let synchronizer = TemplateSynchronizer::new(
        managed_store.clone(),
        managed_store.clone(),
        Arc::new(cache),
        Arc::clone(&relay),
        uninstall,
        ClusterLabels::new(&config.cluster_name, &config.cluster_namespace),
    );
    let aggregator = HistoryAggregator::new(managed_store, hub_store, config.hub_namespace())
        .with_relay(relay);

    let template_settings: ControllerSettings = config.template_sync.settings();
    let status_settings: ControllerSettings = config.status_sync.settings();

    let template_ctx = Arc::new(TemplateSyncContext {
        synchronizer,
        settings: template_settings,
        shutdown: shutdown.clone(),
    });
    let status_ctx = Arc::new(StatusSyncContext {
        aggregator,
        settings: status_settings,
        shutdown,
    });

    let namespace = config.cluster_namespace.clone();
    tokio::join!(
        template_sync::run(managed.clone(), &namespace, template_ctx, triggers),
        status_sync::run(managed, &namespace, status_ctx),
    );

    if let Err(e) = uninstall_watch.await {
        tracing::debug!("Uninstall watch ended abnormally: {}", e);
    }
    tracing::info!("policy-sync stopped");
    Ok(())
}
