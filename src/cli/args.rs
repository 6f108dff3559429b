//! Command line arguments

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Policy template synchronizer and compliance history aggregator
#[derive(Parser, Debug)]
#[command(name = "policy-sync")]
#[command(about = "Synchronizes policy templates and aggregates compliance history on a managed cluster", long_about = None)]
pub struct Args {
    /// Configuration file (defaults to the root config when present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Concurrent template sync reconciles
    #[arg(long)]
    pub template_sync_concurrency: Option<u16>,

    /// Concurrent status sync reconciles
    #[arg(long)]
    pub status_sync_concurrency: Option<u16>,
}

impl Args {
    /// Apply flag overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(concurrency) = self.template_sync_concurrency {
            config.template_sync.concurrency = concurrency;
        }
        if let Some(concurrency) = self.status_sync_concurrency {
            config.status_sync.concurrency = concurrency;
        }
    }
}
