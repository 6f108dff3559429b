//! Policy model layer
//!
//! Rust types for the replicated Policy resource and everything that flows
//! through it:
//! - `policy.rs` - the Policy CustomResource and its templates
//! - `compliance.rs` - compliance states, history and the persisted status
//! - `dependency.rs` - dependency declarations
//! - `identity.rs` - object identities used as watch and map keys
//! - `raw_object.rs` - structured access to embedded object definitions
//! - `registry.rs` - in-family policy kinds
//! - `signal.rs` - status signals attributed to templates

pub mod compliance;
pub mod dependency;
pub mod identity;
pub mod policy;
pub mod raw_object;
pub mod registry;
pub mod signal;

pub use compliance::{
    ComplianceHistory, ComplianceState, DetailsPerTemplate, PolicyStatus, TemplateMeta,
};
pub use dependency::PolicyDependency;
pub use identity::ObjectIdentity;
pub use policy::{Policy, PolicyKey, PolicySpec, PolicyTemplate, RemediationAction};
pub use raw_object::{DecodeError, RawObject};
pub use signal::{InvolvedObject, SignalType, StatusSignal};
