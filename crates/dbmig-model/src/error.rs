//! Error types for database migrations
//!
//! One enum per concern, unified by [`MigrationError`]:
//! - Capacity allocation (`AllocatorError`)
//! - Operation persistence and optimistic concurrency (`StoreError`)
//! - State machine transitions (`TransitionError`)
//! - Supervisor leases (`LeaseError`)
//! - External collaborators (`DependencyError`)
//! - Configuration (`ConfigError`)

use crate::database::SlotHandle;
use crate::ids::{CopyJobId, DatabaseId, InstallationId, OperationId, WorkerId};
use crate::operation::MigrationState;

/// Main migration error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// Capacity allocation failed
    #[error("allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    /// Operation store rejected the request
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transition rejected by the state machine
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Lease could not be acquired or renewed
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// External collaborator failed
    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Request rejected before an operation was created
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Error classification used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lost a race; the supervisor loop is the recovery path
    Conflict,
    /// No room on the destination
    Capacity,
    /// External dependency failed or timed out
    ExternalDependency,
    /// Event not valid for the current state
    InvalidTransition,
    /// Requested entity does not exist
    NotFound,
    /// Caller input or configuration rejected
    Invalid,
    /// Retries exhausted or unexpected failure
    Fatal,
}

impl MigrationError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocator(AllocatorError::CapacityExhausted { .. })
            | Self::Allocator(AllocatorError::NoCapacityAvailable { .. }) => ErrorKind::Capacity,
            Self::Allocator(AllocatorError::AlreadyReserved(_))
            | Self::Store(StoreError::ConflictingOperation { .. })
            | Self::Store(StoreError::VersionConflict { .. })
            | Self::Lease(LeaseError::Held { .. })
            | Self::Lease(LeaseError::NotHolder { .. }) => ErrorKind::Conflict,
            Self::Allocator(AllocatorError::IncompatibleBackend { .. }) => ErrorKind::Capacity,
            Self::Allocator(AllocatorError::DatabaseNotFound(_))
            | Self::Allocator(AllocatorError::DatabaseExists(_))
            | Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::Immutable { .. }) | Self::Transition(_) => {
                ErrorKind::InvalidTransition
            }
            Self::Dependency(_) | Self::Panicked(_) => ErrorKind::ExternalDependency,
            Self::Config(_) | Self::InvalidRequest(_) => ErrorKind::Invalid,
            Self::Store(StoreError::Persistence(_)) => ErrorKind::Fatal,
        }
    }

    /// Whether the failed→requested retry edge may recover from this error
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Capacity | ErrorKind::ExternalDependency | ErrorKind::Conflict
        )
    }

    /// Whether the error reflects a lost race rather than a real failure
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Capacity allocator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// Every slot on the instance is taken
    #[error("capacity exhausted on {database_id} ({capacity} slots)")]
    CapacityExhausted {
        /// Instance
        database_id: DatabaseId,
        /// Total capacity
        capacity: u32,
    },

    /// The installation already holds a slot on the instance
    #[error("installation {} already holds slot {} on {}", .0.installation_id, .0.slot, .0.database_id)]
    AlreadyReserved(SlotHandle),

    /// The instance cannot host the installation
    #[error("database {database_id} incompatible: {reason}")]
    IncompatibleBackend {
        /// Instance
        database_id: DatabaseId,
        /// Mismatch description
        reason: String,
    },

    /// No eligible instance has a free slot
    #[error("no capacity available for {kind}")]
    NoCapacityAvailable {
        /// Requested backend kind
        kind: String,
    },

    /// Unknown instance
    #[error("database not found: {0}")]
    DatabaseNotFound(DatabaseId),

    /// Instance registered twice
    #[error("database already registered: {0}")]
    DatabaseExists(DatabaseId),
}

/// Operation store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Another operation is active for the installation
    #[error("installation {installation_id} already has active operation {existing}")]
    ConflictingOperation {
        /// Installation
        installation_id: InstallationId,
        /// The active operation
        existing: OperationId,
    },

    /// Compare-and-swap lost a race
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Operation
        id: OperationId,
        /// Version the caller read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Terminal operations are never mutated
    #[error("operation {id} is {state} and immutable")]
    Immutable {
        /// Operation
        id: OperationId,
        /// Terminal state
        state: MigrationState,
    },

    /// Unknown operation
    #[error("operation not found: {0}")]
    NotFound(OperationId),

    /// Snapshot could not be read or written
    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Event not in the transition table for this state
    #[error("event {event} not allowed in state {state}")]
    InvalidTransition {
        /// Current state
        state: MigrationState,
        /// Rejected event
        event: &'static str,
    },

    /// Rollback requested outside `migrated`
    #[error("cannot roll back operation in state {0}")]
    InvalidStateForCancel(MigrationState),

    /// Commit requested outside `migrated`
    #[error("cannot commit operation in state {0}")]
    InvalidStateForCommit(MigrationState),
}

/// Lease errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// Another worker holds an unexpired lease
    #[error("lease on {key} held by {holder} until {expires_at}")]
    Held {
        /// Leased installation
        key: InstallationId,
        /// Current holder
        holder: WorkerId,
        /// Expiry (unix millis)
        expires_at: i64,
    },

    /// Renewal or release attempted by a non-holder
    #[error("{worker} does not hold the lease on {key}")]
    NotHolder {
        /// Leased installation
        key: InstallationId,
        /// Caller
        worker: WorkerId,
    },
}

/// External collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// Installation unknown to the lifecycle controller
    #[error("installation not found: {0}")]
    InstallationNotFound(InstallationId),

    /// Installation did not reach a quiesced state
    #[error("installation {installation_id} not ready: {reason}")]
    LifecycleUnready {
        /// Installation
        installation_id: InstallationId,
        /// Controller message
        reason: String,
    },

    /// Lifecycle controller call failed
    #[error("lifecycle controller failed: {0}")]
    Lifecycle(String),

    /// Data copy reported failure
    #[error("copy job {job} failed: {reason}")]
    CopyFailed {
        /// Job handle
        job: CopyJobId,
        /// Executor message
        reason: String,
    },

    /// Copy executor call failed
    #[error("copy executor failed: {0}")]
    CopyExecutor(String),

    /// External call exceeded its deadline
    #[error("{call} timed out after {duration_ms}ms")]
    Timeout {
        /// Call name
        call: &'static str,
        /// Deadline
        duration_ms: u64,
    },
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Value out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },

    /// Config document could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Config file could not be read
    #[error("io error: {0}")]
    Io(String),
}

/// Result alias for migration operations
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;
