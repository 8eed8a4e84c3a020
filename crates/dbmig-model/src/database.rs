//! Shared multi-tenant database instances and their slots

use crate::backend::DatabaseKind;
use crate::ids::{DatabaseId, InstallationId, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved capacity unit on a shared instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotHandle {
    /// Instance holding the slot
    pub database_id: DatabaseId,
    /// Slot owner
    pub installation_id: InstallationId,
    /// Operation that reserved the slot, absent for pre-existing tenants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Slot number, unique per instance while held
    pub slot: u32,
}

/// A shared database instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiTenantDatabase {
    /// Instance ID
    pub id: DatabaseId,
    /// Backend kind served by this instance
    pub kind: DatabaseKind,
    /// Total slot capacity
    pub capacity: u32,
    /// Schema/version compatibility tag
    pub compatibility: String,
    /// Occupied slots keyed by installation
    #[serde(default)]
    pub slots: BTreeMap<InstallationId, SlotHandle>,
}

impl MultiTenantDatabase {
    /// Empty instance
    #[must_use]
    pub fn new(
        id: impl Into<DatabaseId>,
        kind: DatabaseKind,
        capacity: u32,
        compatibility: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity,
            compatibility: compatibility.into(),
            slots: BTreeMap::new(),
        }
    }

    /// Occupied slot count
    #[inline]
    #[must_use]
    pub fn occupied(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Free slot count
    #[inline]
    #[must_use]
    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.occupied())
    }

    /// Whether no slot is free
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Lowest slot number not currently held
    #[must_use]
    pub fn next_free_slot(&self) -> Option<u32> {
        (0..self.capacity).find(|n| !self.slots.values().any(|s| s.slot == *n))
    }
}
