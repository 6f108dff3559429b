//! Configuration loading and merging logic
//!
//! Handles loading configuration from multiple sources and merging them
//! according to precedence rules.

use super::schema::Config;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Config file read when no explicit path is given
///
/// `POLICY_SYNC_CONFIG_DIR` replaces the platform config directory. Without
/// it, a process with no home directory (the usual in-cluster case) has no
/// root config.
pub fn root_config_path() -> Option<PathBuf> {
    let dir = match std::env::var_os("POLICY_SYNC_CONFIG_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => ProjectDirs::from("io", "open-cluster-management", "policy-sync")?
            .config_dir()
            .to_path_buf(),
    };
    Some(dir.join("config.yaml"))
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with all layers merged
    ///
    /// Precedence order (highest to lowest):
    /// 1. Environment variable overrides
    /// 2. Config file (explicit path, or the root config when present)
    /// 3. Built-in defaults
    ///
    /// An explicit path that does not exist is an error; a missing root
    /// config is not.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = Self::load_defaults();

        match path {
            Some(path) => config = Self::load_file(path)?,
            None => {
                if let Some(root) = root_config_path().filter(|root| root.exists()) {
                    config = Self::load_file(&root)?;
                }
            }
        }

        config = Self::apply_env_overrides(config);
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject configurations the controllers cannot run with
    pub fn validate(config: &Config) -> Result<()> {
        if config.cluster_name.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "clusterName must be set (config file or POLICY_SYNC_CLUSTER_NAME)"
            ));
        }
        if config.cluster_namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("clusterNamespace must not be empty"));
        }
        for (name, controller) in [
            ("templateSync", &config.template_sync),
            ("statusSync", &config.status_sync),
        ] {
            if controller.concurrency == 0 {
                return Err(anyhow::anyhow!("{}.concurrency must be at least 1", name));
            }
        }
        if let Some(kubeconfig) = &config.hub_kubeconfig {
            if !kubeconfig.exists() {
                return Err(anyhow::anyhow!(
                    "hubKubeconfig not found: {}",
                    kubeconfig.display()
                ));
            }
        }
        Ok(())
    }

    /// Load default configuration
    pub fn load_defaults() -> Config {
        Config::default()
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: Config) -> Config {
        if let Ok(name) = std::env::var("POLICY_SYNC_CLUSTER_NAME") {
            config.cluster_name = name;
        }

        if let Ok(namespace) = std::env::var("POLICY_SYNC_CLUSTER_NAMESPACE") {
            config.cluster_namespace = namespace;
        }

        if let Ok(namespace) = std::env::var("POLICY_SYNC_HUB_CLUSTER_NAMESPACE") {
            config.hub_cluster_namespace = Some(namespace);
        }

        if let Ok(level) = std::env::var("POLICY_SYNC_LOG_LEVEL") {
            config.logger.level = level;
        }

        config
    }
}
