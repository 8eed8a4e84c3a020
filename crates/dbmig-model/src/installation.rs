//! Installation records as reported by the lifecycle controller

use crate::backend::BackendDescriptor;
use crate::ids::InstallationId;
use serde::{Deserialize, Serialize};

/// Installation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationStatus {
    /// Serving traffic normally
    #[default]
    Stable,
    /// Paused for a database migration
    Migrating,
    /// Left in an inconsistent state, needs operator attention
    Unstable,
}

/// A tenant workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    /// Installation ID
    pub id: InstallationId,
    /// Current database backend
    pub backend: BackendDescriptor,
    /// Lifecycle status
    pub status: InstallationStatus,
    /// Schema/version tag the destination database must support
    pub database_version: String,
}

impl Installation {
    /// New stable installation
    #[must_use]
    pub fn new(
        id: impl Into<InstallationId>,
        backend: BackendDescriptor,
        database_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            status: InstallationStatus::Stable,
            database_version: database_version.into(),
        }
    }
}
