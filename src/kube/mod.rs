//! Kubernetes client module
//!
//! Builds the clients for the managed cluster and, when configured, the hub.
//!
//! Proxy settings come from the standard environment variables
//! (`HTTP_PROXY`, `HTTPS_PROXY`, `NO_PROXY`) through kube's own config.

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;

/// Initialize a client for the cluster this process runs against
///
/// Uses the default kubeconfig loading strategy:
/// 1. In-cluster config (if running in a pod)
/// 2. KUBECONFIG environment variable
/// 3. ~/.kube/config
pub async fn create_client() -> Result<Client> {
    let config = Config::infer()
        .await
        .context("Failed to infer Kubernetes configuration")?;
    tracing::debug!(cluster = %config.cluster_url, "Connecting to managed cluster");
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Initialize a client from an explicit kubeconfig file
pub async fn create_client_from_kubeconfig(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig: {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("Failed to load kubeconfig: {}", path.display()))?;
    tracing::debug!(cluster = %config.cluster_url, "Connecting to hub cluster");
    Client::try_from(config).context("Failed to create hub Kubernetes client")
}

/// Client for the hub, or the managed client when hub and managed are one cluster
pub async fn hub_client(kubeconfig: Option<&Path>, managed: &Client) -> Result<Client> {
    match kubeconfig {
        Some(path) => create_client_from_kubeconfig(path).await,
        None => Ok(managed.clone()),
    }
}
