//! dbmig core - operator API and local state
//!
//! [`MigrationService`] is the request/get/list/commit/rollback boundary;
//! [`LocalState`] wires it, and a supervisor, over a JSON state file.

pub mod output;
pub mod service;
pub mod state;

pub use service::MigrationService;
pub use state::{LocalState, MergeReport, StateLock, StateSnapshot};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
