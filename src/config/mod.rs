//! Configuration for the policy-sync controllers
//!
//! Layered the usual way: built-in defaults, then a YAML file, then
//! `POLICY_SYNC_*` environment overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{Config, ControllerConfig, LoggerConfig};
