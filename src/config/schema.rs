//! Configuration schema definitions
//!
//! Defines the structure of configuration files using serde for serialization.

use crate::controller::ControllerSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Name of the managed cluster, stamped onto every child object
    #[serde(default)]
    pub cluster_name: String,

    /// Namespace holding the replicated Policies on the managed cluster
    #[serde(default = "default_cluster_namespace")]
    pub cluster_namespace: String,

    /// Namespace of the Policy copies on the hub; defaults to `clusterNamespace`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_cluster_namespace: Option<String>,

    /// Kubeconfig for the hub; absent means hub and managed are one cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_kubeconfig: Option<PathBuf>,

    /// Namespace the addon's own Deployment runs in
    #[serde(default = "default_controller_namespace")]
    pub controller_namespace: String,

    /// Name of the addon's Deployment, watched for the uninstall annotation
    #[serde(default = "default_deployment_name")]
    pub deployment_name: String,

    #[serde(default)]
    pub template_sync: ControllerConfig,

    #[serde(default)]
    pub status_sync: ControllerConfig,

    /// Logger configuration
    #[serde(default)]
    pub logger: LoggerConfig,
}

/// Per-controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Reconciles allowed to run at once
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    /// Requeue delay after a non-retryable error
    #[serde(default = "default_error_requeue_seconds")]
    pub error_requeue_seconds: u64,
}

/// Logger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append logs to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_cluster_namespace() -> String {
    "local-cluster".to_string()
}

fn default_controller_namespace() -> String {
    "open-cluster-management-agent-addon".to_string()
}

fn default_deployment_name() -> String {
    "governance-policy-framework".to_string()
}

fn default_concurrency() -> u16 {
    3
}

fn default_error_requeue_seconds() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Hub namespace, falling back to the managed cluster namespace
    pub fn hub_namespace(&self) -> &str {
        self.hub_cluster_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.cluster_namespace)
    }
}

impl ControllerConfig {
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            concurrency: self.concurrency,
            error_requeue: Duration::from_secs(self.error_requeue_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            cluster_namespace: default_cluster_namespace(),
            hub_cluster_namespace: None,
            hub_kubeconfig: None,
            controller_namespace: default_controller_namespace(),
            deployment_name: default_deployment_name(),
            template_sync: ControllerConfig::default(),
            status_sync: ControllerConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            error_requeue_seconds: default_error_requeue_seconds(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}
