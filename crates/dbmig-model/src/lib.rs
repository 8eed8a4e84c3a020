//! dbmig model - records shared across the migration control plane
//!
//! Defines:
//! - Identifiers for installations, shared databases, operations and workers
//! - Backend descriptors and database kinds
//! - Installation and multi-tenant database records
//! - Migration operations, their states and caller-facing views
//! - The error taxonomy used by every other crate

#![warn(unreachable_pub)]

pub mod backend;
pub mod database;
pub mod error;
pub mod ids;
pub mod installation;
pub mod operation;

pub use backend::{BackendDescriptor, DatabaseKind, UnknownDatabaseKind};
pub use database::{MultiTenantDatabase, SlotHandle};
pub use error::{
    AllocatorError, ConfigError, DependencyError, ErrorKind, LeaseError, MigrationError,
    StoreError, TransitionError,
};
pub use ids::{CopyJobId, DatabaseId, InstallationId, OperationId, WorkerId};
pub use installation::{Installation, InstallationStatus};
pub use operation::{
    MigrationOperation, MigrationOperationView, MigrationRequest, MigrationState,
    MultiTenantDestination, OperationFilter, Paging, UnknownMigrationState,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
