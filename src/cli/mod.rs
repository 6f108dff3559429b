//! Command line handling
//!
//! Flag parsing and logging setup for the binary.

mod args;
mod logging;

pub use args::Args;
pub use logging::*;
