//! dbmig kernel - installation database migration engine
//!
//! Moves a tenant installation's data onto a slot of a shared database
//! instance through an explicit state machine:
//!
//! ```text
//! requested -> reserving -> quiescing -> copying -> migrated
//!   migrated -> committing -> committed
//!   migrated -> rolling-back -> rolled-back
//!   failed -> requested | abandoned
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dbmig_kernel::prelude::*;
//!
//! let supervisor = Arc::new(Supervisor::new(store, allocator, lifecycle, copier, clock, config));
//! let (stop, shutdown) = tokio::sync::watch::channel(false);
//! tokio::spawn(supervisor.run(shutdown));
//! ```

// Core modules
pub mod allocator;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod lease;
pub mod logging;
pub mod state_machine;
pub mod store;
pub mod supervisor;

// Test harness
pub mod test_harness;

/// Common imports
pub mod prelude {
    pub use crate::allocator::{CapacityAllocator, DatabaseUsage, Release, SlotRequirement};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::collaborators::{
        CopyExecutor, CopyStatus, InMemoryCopyExecutor, InMemoryLifecycleController,
        LifecycleController, QuiesceStatus,
    };
    pub use crate::config::SupervisorConfig;
    pub use crate::lease::{Lease, LeaseGuard, LeaseTable};
    pub use crate::state_machine::{MigrationEvent, Transition};
    pub use crate::store::{InMemoryOperationStore, OperationStore};
    pub use crate::supervisor::{ReconcileOutcome, ReconcileReport, Supervisor};
    pub use dbmig_model::*;
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
