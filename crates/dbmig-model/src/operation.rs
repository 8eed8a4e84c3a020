//! Migration operations
//!
//! A [`MigrationOperation`] is the unit of work moving one installation from
//! its current backend to a slot on a shared instance. The full record carries
//! bookkeeping the supervisor needs; API callers only ever see a
//! [`MigrationOperationView`].

use crate::backend::{BackendDescriptor, DatabaseKind};
use crate::database::SlotHandle;
use crate::ids::{CopyJobId, DatabaseId, InstallationId, OperationId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Migration operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationState {
    /// Accepted, not yet picked up
    Requested,
    /// Reserving a slot on the destination
    Reserving,
    /// Waiting for the installation to pause
    Quiescing,
    /// Data copy in flight
    Copying,
    /// Copy done, awaiting commit or rollback
    Migrated,
    /// Repointing to the destination
    Committing,
    /// Restoring the source backend
    RollingBack,
    /// Migration finalized
    Committed,
    /// Migration reverted
    RolledBack,
    /// Last attempt failed, waiting for retry
    Failed,
    /// Retries exhausted
    Abandoned,
}

impl MigrationState {
    /// Every state, in transition-table order
    pub const ALL: [MigrationState; 11] = [
        MigrationState::Requested,
        MigrationState::Reserving,
        MigrationState::Quiescing,
        MigrationState::Copying,
        MigrationState::Migrated,
        MigrationState::Committing,
        MigrationState::RollingBack,
        MigrationState::Committed,
        MigrationState::RolledBack,
        MigrationState::Failed,
        MigrationState::Abandoned,
    ];

    /// Wire name of the state
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Reserving => "reserving",
            Self::Quiescing => "quiescing",
            Self::Copying => "copying",
            Self::Migrated => "migrated",
            Self::Committing => "committing",
            Self::RollingBack => "rolling-back",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// No further transitions are permitted
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Abandoned)
    }

    /// Counts against the one-active-operation-per-installation rule
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The installation is paused in this state
    #[inline]
    #[must_use]
    pub fn holds_quiesced_installation(self) -> bool {
        matches!(
            self,
            Self::Copying | Self::Migrated | Self::Committing | Self::RollingBack
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized state name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown migration state: {0}")]
pub struct UnknownMigrationState(pub String);

impl FromStr for MigrationState {
    type Err = UnknownMigrationState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownMigrationState(s.to_string()))
    }
}

/// Request to migrate an installation's database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationRequest {
    /// Installation to migrate
    #[serde(rename = "InstallationID")]
    pub installation_id: InstallationId,
    /// Destination backend kind
    pub destination_database: DatabaseKind,
    /// Pinned destination instance; the allocator picks one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_multi_tenant: Option<MultiTenantDestination>,
}

impl MigrationRequest {
    /// Request with an optional pinned instance
    #[must_use]
    pub fn new(
        installation_id: impl Into<InstallationId>,
        destination_database: DatabaseKind,
        database_id: Option<DatabaseId>,
    ) -> Self {
        Self {
            installation_id: installation_id.into(),
            destination_database,
            destination_multi_tenant: database_id
                .map(|database_id| MultiTenantDestination { database_id }),
        }
    }

    /// Pinned destination instance, if any
    #[must_use]
    pub fn pinned_database(&self) -> Option<&DatabaseId> {
        self.destination_multi_tenant.as_ref().map(|d| &d.database_id)
    }
}

/// Multi-tenant destination selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiTenantDestination {
    /// Instance ID
    #[serde(rename = "DatabaseID")]
    pub database_id: DatabaseId,
}

/// Full operation record as held by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOperation {
    /// Operation ID
    pub id: OperationId,
    /// Installation being migrated
    pub installation_id: InstallationId,
    /// Backend the installation started on
    pub source: BackendDescriptor,
    /// Requested destination; `database_id` is filled in by selection when unpinned
    pub destination: BackendDescriptor,
    /// Whether the caller chose the destination instance
    pub destination_pinned: bool,
    /// Current state
    pub state: MigrationState,
    /// Creation time (unix millis)
    pub request_at: i64,
    /// Last transition time (unix millis)
    pub last_transition_at: i64,
    /// Optimistic concurrency version, bumped on every write
    pub version: u64,
    /// Failed attempts so far
    pub attempts: u32,
    /// Earliest retry time after a failure (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    /// Last failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Slot held on the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotHandle>,
    /// External copy job in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_job: Option<CopyJobId>,
}

impl MigrationOperation {
    /// New operation in `requested`
    #[must_use]
    pub fn new(
        installation_id: InstallationId,
        source: BackendDescriptor,
        destination: BackendDescriptor,
        now_millis: i64,
    ) -> Self {
        let destination_pinned = destination.database_id.is_some();
        Self {
            id: OperationId::new(),
            installation_id,
            source,
            destination,
            destination_pinned,
            state: MigrationState::Requested,
            request_at: now_millis,
            last_transition_at: now_millis,
            version: 0,
            attempts: 0,
            next_attempt_at: None,
            failure_reason: None,
            slot: None,
            copy_job: None,
        }
    }

    /// Caller-facing projection
    #[must_use]
    pub fn view(&self) -> MigrationOperationView {
        MigrationOperationView::from(self)
    }
}

/// Serialized operation as returned to API and CLI callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationOperationView {
    /// Operation ID
    #[serde(rename = "ID")]
    pub id: OperationId,
    /// Installation ID
    #[serde(rename = "InstallationID")]
    pub installation_id: InstallationId,
    /// Current state
    pub state: MigrationState,
    /// Destination descriptor
    pub destination: BackendDescriptor,
    /// Creation time (unix millis)
    pub request_at: i64,
    /// Last failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&MigrationOperation> for MigrationOperationView {
    fn from(op: &MigrationOperation) -> Self {
        Self {
            id: op.id,
            installation_id: op.installation_id.clone(),
            state: op.state,
            destination: op.destination.clone(),
            request_at: op.request_at,
            failure_reason: op.failure_reason.clone(),
        }
    }
}

/// Page selection for list calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// Zero-based page number
    pub page: u32,
    /// Items per page; zero means unbounded
    pub per_page: u32,
}

impl Paging {
    /// Default page size used by the CLI
    pub const DEFAULT_PER_PAGE: u32 = 100;

    /// Everything in one page
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self {
            page: 0,
            per_page: 0,
        }
    }

    /// Specific page
    #[inline]
    #[must_use]
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    /// Apply to an already-ordered sequence
    pub fn apply<T>(&self, items: impl Iterator<Item = T>) -> Vec<T> {
        if self.per_page == 0 {
            return items.collect();
        }
        let skip = (self.page as usize).saturating_mul(self.per_page as usize);
        items.skip(skip).take(self.per_page as usize).collect()
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_PER_PAGE)
    }
}

/// Filter for listing operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    /// Only this installation
    pub installation_id: Option<InstallationId>,
    /// Only this state
    pub state: Option<MigrationState>,
    /// Page selection
    pub paging: Paging,
}

impl OperationFilter {
    /// Unfiltered, unpaged
    #[must_use]
    pub fn all() -> Self {
        Self {
            installation_id: None,
            state: None,
            paging: Paging::all(),
        }
    }

    /// Restrict to an installation
    #[must_use]
    pub fn with_installation(mut self, id: impl Into<InstallationId>) -> Self {
        self.installation_id = Some(id.into());
        self
    }

    /// Restrict to a state
    #[must_use]
    pub fn with_state(mut self, state: MigrationState) -> Self {
        self.state = Some(state);
        self
    }

    /// Select a page
    #[must_use]
    pub fn with_paging(mut self, paging: Paging) -> Self {
        self.paging = paging;
        self
    }

    /// Whether the operation passes the installation/state filters
    #[must_use]
    pub fn matches(&self, op: &MigrationOperation) -> bool {
        self.installation_id
            .as_ref()
            .map_or(true, |id| *id == op.installation_id)
            && self.state.map_or(true, |state| state == op.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = MigrationState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                MigrationState::Committed,
                MigrationState::RolledBack,
                MigrationState::Abandoned
            ]
        );
    }

    #[test]
    fn state_names_round_trip_through_serde() {
        for state in MigrationState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            assert_eq!(state.as_str().parse::<MigrationState>().unwrap(), state);
        }
    }

    #[test]
    fn pinned_destination_is_detected() {
        let source = BackendDescriptor::dedicated(DatabaseKind::MysqlOperator);
        let pinned = MigrationOperation::new(
            "i1".into(),
            source.clone(),
            BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1"),
            10,
        );
        assert!(pinned.destination_pinned);

        let unpinned = MigrationOperation::new(
            "i1".into(),
            source,
            BackendDescriptor::dedicated(DatabaseKind::MultiTenantRdsPostgres),
            10,
        );
        assert!(!unpinned.destination_pinned);
        assert_eq!(unpinned.state, MigrationState::Requested);
    }

    #[test]
    fn view_hides_bookkeeping() {
        let mut op = MigrationOperation::new(
            "i1".into(),
            BackendDescriptor::dedicated(DatabaseKind::MysqlOperator),
            BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1"),
            1_700_000_000_000,
        );
        op.version = 7;
        op.failure_reason = Some("copy failed".into());

        let json = serde_json::to_value(op.view()).unwrap();
        assert_eq!(json["InstallationID"], "i1");
        assert_eq!(json["State"], "requested");
        assert_eq!(json["RequestAt"], 1_700_000_000_000_i64);
        assert_eq!(json["FailureReason"], "copy failed");
        assert!(json.get("Version").is_none());
        assert!(json.get("Attempts").is_none());
    }

    #[test]
    fn request_serializes_with_nested_destination() {
        let request = MigrationRequest::new(
            "i1",
            DatabaseKind::MultiTenantRdsPostgres,
            Some(DatabaseId::new("db-1")),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["InstallationID"], "i1");
        assert_eq!(json["DestinationDatabase"], "aws-multitenant-rds-postgres");
        assert_eq!(json["DestinationMultiTenant"]["DatabaseID"], "db-1");
        assert_eq!(request.pinned_database().map(DatabaseId::as_str), Some("db-1"));
    }

    #[test]
    fn paging_slices_ordered_items() {
        let items = 0..10;
        assert_eq!(Paging::new(1, 3).apply(items.clone()), vec![3, 4, 5]);
        assert_eq!(Paging::new(3, 3).apply(items.clone()), vec![9]);
        assert_eq!(Paging::new(4, 3).apply(items.clone()), Vec::<i32>::new());
        assert_eq!(Paging::all().apply(items).len(), 10);
    }
}
