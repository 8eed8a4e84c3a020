//! Capacity allocator for shared multi-tenant databases
//!
//! Owns the occupancy table. Each instance is one row in a [`DashMap`]; a
//! reservation holds the row's write guard for the whole check-and-insert, so
//! concurrent reservations against the same instance are serialized while
//! different instances proceed in parallel.

use dashmap::DashMap;
use dbmig_model::{
    AllocatorError, DatabaseId, DatabaseKind, InstallationId, MultiTenantDatabase, OperationId,
    SlotHandle,
};
use std::cmp::Ordering;

/// What the destination must provide for an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequirement {
    /// Backend kind the installation is moving to
    pub kind: DatabaseKind,
    /// Schema/version tag the instance must carry
    pub database_version: String,
}

impl SlotRequirement {
    /// Requirement for `kind` at `database_version`
    #[must_use]
    pub fn new(kind: DatabaseKind, database_version: impl Into<String>) -> Self {
        Self {
            kind,
            database_version: database_version.into(),
        }
    }
}

/// Outcome of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// A slot was freed
    Released(SlotHandle),
    /// Nothing was held; release is a no-op
    NotHeld,
}

/// Per-instance occupancy summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUsage {
    /// Instance
    pub id: DatabaseId,
    /// Backend kind
    pub kind: DatabaseKind,
    /// Total slots
    pub capacity: u32,
    /// Held slots
    pub occupied: u32,
}

/// Allocator for shared database slots
#[derive(Debug, Default)]
pub struct CapacityAllocator {
    databases: DashMap<DatabaseId, MultiTenantDatabase>,
}

impl CapacityAllocator {
    /// Empty allocator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            databases: DashMap::new(),
        }
    }

    /// Allocator seeded from persisted rows
    #[must_use]
    pub fn from_databases(databases: impl IntoIterator<Item = MultiTenantDatabase>) -> Self {
        Self {
            databases: databases
                .into_iter()
                .map(|db| (db.id.clone(), db))
                .collect(),
        }
    }

    /// Register a new instance
    ///
    /// # Errors
    /// - `AllocatorError::DatabaseExists` if the id is already known
    pub fn register_database(&self, database: MultiTenantDatabase) -> Result<(), AllocatorError> {
        match self.databases.entry(database.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AllocatorError::DatabaseExists(database.id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::info!(
                    database = %database.id,
                    capacity = database.capacity,
                    "registered multi-tenant database"
                );
                entry.insert(database);
                Ok(())
            }
        }
    }

    /// Reserve a slot for `installation` on `database`
    ///
    /// The capacity and compatibility checks and the insert happen under the
    /// instance's row lock.
    ///
    /// # Errors
    /// - `AllocatorError::DatabaseNotFound` for an unknown instance
    /// - `AllocatorError::IncompatibleBackend` on kind or version mismatch
    /// - `AllocatorError::AlreadyReserved` if the installation holds a slot there
    /// - `AllocatorError::CapacityExhausted` if no slot is free
    pub fn reserve(
        &self,
        installation: &InstallationId,
        database: &DatabaseId,
        requirement: &SlotRequirement,
        operation: Option<OperationId>,
    ) -> Result<SlotHandle, AllocatorError> {
        let mut row = self
            .databases
            .get_mut(database)
            .ok_or_else(|| AllocatorError::DatabaseNotFound(database.clone()))?;

        check_compatible(&row, requirement)?;

        if let Some(existing) = row.slots.get(installation) {
            return Err(AllocatorError::AlreadyReserved(existing.clone()));
        }

        let slot = row
            .next_free_slot()
            .ok_or_else(|| AllocatorError::CapacityExhausted {
                database_id: database.clone(),
                capacity: row.capacity,
            })?;

        let handle = SlotHandle {
            database_id: database.clone(),
            installation_id: installation.clone(),
            operation_id: operation,
            slot,
        };
        row.slots.insert(installation.clone(), handle.clone());

        tracing::debug!(
            installation = %installation,
            database = %database,
            slot,
            occupied = row.occupied(),
            "reserved slot"
        );
        Ok(handle)
    }

    /// Release whatever slot `installation` holds on `database`
    ///
    /// Idempotent: releasing nothing (or on an unknown instance) succeeds.
    pub fn release(&self, installation: &InstallationId, database: &DatabaseId) -> Release {
        let Some(mut row) = self.databases.get_mut(database) else {
            return Release::NotHeld;
        };
        match row.slots.remove(installation) {
            Some(handle) => {
                tracing::debug!(installation = %installation, database = %database, "released slot");
                Release::Released(handle)
            }
            None => Release::NotHeld,
        }
    }

    /// Release `handle` only if the slot is still the one it names
    ///
    /// A slot re-reserved by a later operation is left alone.
    pub fn release_slot(&self, handle: &SlotHandle) -> Release {
        let Some(mut row) = self.databases.get_mut(&handle.database_id) else {
            return Release::NotHeld;
        };
        let owned = row
            .slots
            .get(&handle.installation_id)
            .is_some_and(|held| held.operation_id == handle.operation_id && held.slot == handle.slot);
        if !owned {
            return Release::NotHeld;
        }
        row.slots
            .remove(&handle.installation_id)
            .map_or(Release::NotHeld, Release::Released)
    }

    /// Pick the least-loaded eligible instance for `requirement`
    ///
    /// Load is the occupied fraction of capacity; ties go to the lowest id.
    ///
    /// # Errors
    /// - `AllocatorError::NoCapacityAvailable` if nothing is eligible
    pub fn select(
        &self,
        requirement: &SlotRequirement,
        exclude_full: bool,
    ) -> Result<DatabaseId, AllocatorError> {
        self.select_avoiding(requirement, exclude_full, None)
    }

    /// [`CapacityAllocator::select`], never returning `avoid`
    ///
    /// Used when the installation already lives on a shared instance.
    ///
    /// # Errors
    /// - `AllocatorError::NoCapacityAvailable` if nothing is eligible
    pub fn select_avoiding(
        &self,
        requirement: &SlotRequirement,
        exclude_full: bool,
        avoid: Option<&DatabaseId>,
    ) -> Result<DatabaseId, AllocatorError> {
        let mut candidates: Vec<DatabaseUsage> = self
            .databases
            .iter()
            .filter(|row| Some(row.key()) != avoid)
            .filter(|row| check_compatible(row.value(), requirement).is_ok())
            .filter(|row| !(exclude_full && row.is_full()))
            .map(|row| usage(row.value()))
            .collect();

        candidates.sort_by(|a, b| compare_load(a, b).then_with(|| a.id.cmp(&b.id)));

        candidates
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| AllocatorError::NoCapacityAvailable {
                kind: requirement.kind.to_string(),
            })
    }

    /// Slot held by `installation` on `database`
    #[must_use]
    pub fn holder(&self, installation: &InstallationId, database: &DatabaseId) -> Option<SlotHandle> {
        self.databases
            .get(database)
            .and_then(|row| row.slots.get(installation).cloned())
    }

    /// Check that `database` could take a reservation for `requirement` right now
    ///
    /// Nothing is reserved; a concurrent reservation may still win the last slot.
    ///
    /// # Errors
    /// - `AllocatorError::DatabaseNotFound` for an unknown instance
    /// - `AllocatorError::IncompatibleBackend` on kind or version mismatch
    /// - `AllocatorError::CapacityExhausted` if the instance is full
    pub fn admit(
        &self,
        database: &DatabaseId,
        requirement: &SlotRequirement,
    ) -> Result<u32, AllocatorError> {
        let row = self
            .databases
            .get(database)
            .ok_or_else(|| AllocatorError::DatabaseNotFound(database.clone()))?;
        check_compatible(&row, requirement)?;
        if row.is_full() {
            return Err(AllocatorError::CapacityExhausted {
                database_id: database.clone(),
                capacity: row.capacity,
            });
        }
        Ok(row.free())
    }

    /// Free slots on `database`
    ///
    /// # Errors
    /// - `AllocatorError::DatabaseNotFound` for an unknown instance
    pub fn free_slots(&self, database: &DatabaseId) -> Result<u32, AllocatorError> {
        self.databases
            .get(database)
            .map(|row| row.free())
            .ok_or_else(|| AllocatorError::DatabaseNotFound(database.clone()))
    }

    /// Usage of every instance, ordered by id
    #[must_use]
    pub fn usage(&self) -> Vec<DatabaseUsage> {
        let mut all: Vec<_> = self.databases.iter().map(|row| usage(row.value())).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Copy of every row, ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<MultiTenantDatabase> {
        let mut all: Vec<_> = self.databases.iter().map(|row| row.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Total slots held across all instances
    #[must_use]
    pub fn total_occupied(&self) -> u64 {
        self.databases
            .iter()
            .map(|row| u64::from(row.occupied()))
            .sum()
    }
}

fn check_compatible(
    database: &MultiTenantDatabase,
    requirement: &SlotRequirement,
) -> Result<(), AllocatorError> {
    if database.kind != requirement.kind {
        return Err(AllocatorError::IncompatibleBackend {
            database_id: database.id.clone(),
            reason: format!("serves {}, requested {}", database.kind, requirement.kind),
        });
    }
    if database.compatibility != requirement.database_version {
        return Err(AllocatorError::IncompatibleBackend {
            database_id: database.id.clone(),
            reason: format!(
                "supports {}, installation needs {}",
                database.compatibility, requirement.database_version
            ),
        });
    }
    Ok(())
}

fn usage(database: &MultiTenantDatabase) -> DatabaseUsage {
    DatabaseUsage {
        id: database.id.clone(),
        kind: database.kind,
        capacity: database.capacity,
        occupied: database.occupied(),
    }
}

/// Compare occupied/capacity fractions without floating point
fn compare_load(a: &DatabaseUsage, b: &DatabaseUsage) -> Ordering {
    let lhs = u64::from(a.occupied) * u64::from(b.capacity.max(1));
    let rhs = u64::from(b.occupied) * u64::from(a.capacity.max(1));
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG: DatabaseKind = DatabaseKind::MultiTenantRdsPostgres;

    fn allocator(dbs: &[(&str, u32)]) -> CapacityAllocator {
        CapacityAllocator::from_databases(
            dbs.iter()
                .map(|(id, cap)| MultiTenantDatabase::new(*id, PG, *cap, "pg14")),
        )
    }

    fn req() -> SlotRequirement {
        SlotRequirement::new(PG, "pg14")
    }

    #[test]
    fn reserve_until_exhausted() {
        let alloc = allocator(&[("db-1", 2)]);
        let db = DatabaseId::new("db-1");

        alloc.reserve(&"i1".into(), &db, &req(), None).unwrap();
        alloc.reserve(&"i2".into(), &db, &req(), None).unwrap();
        let err = alloc.reserve(&"i3".into(), &db, &req(), None).unwrap_err();
        assert_eq!(
            err,
            AllocatorError::CapacityExhausted {
                database_id: db.clone(),
                capacity: 2
            }
        );
        assert_eq!(alloc.free_slots(&db).unwrap(), 0);
    }

    #[test]
    fn second_reservation_for_same_installation_is_rejected() {
        let alloc = allocator(&[("db-1", 5)]);
        let db = DatabaseId::new("db-1");
        let first = alloc.reserve(&"i1".into(), &db, &req(), None).unwrap();
        let err = alloc.reserve(&"i1".into(), &db, &req(), None).unwrap_err();
        assert_eq!(err, AllocatorError::AlreadyReserved(first));
        assert_eq!(alloc.free_slots(&db).unwrap(), 4);
    }

    #[test]
    fn incompatible_version_is_reported() {
        let alloc = allocator(&[("db-1", 5)]);
        let err = alloc
            .reserve(&"i1".into(), &"db-1".into(), &SlotRequirement::new(PG, "pg11"), None)
            .unwrap_err();
        assert!(matches!(err, AllocatorError::IncompatibleBackend { .. }));

        let err = alloc
            .reserve(
                &"i1".into(),
                &"db-1".into(),
                &SlotRequirement::new(DatabaseKind::MultiTenantRdsMysql, "pg14"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AllocatorError::IncompatibleBackend { .. }));
    }

    #[test]
    fn release_round_trip_restores_free_count() {
        let alloc = allocator(&[("db-1", 3)]);
        let db = DatabaseId::new("db-1");
        let before = alloc.free_slots(&db).unwrap();

        alloc.reserve(&"i1".into(), &db, &req(), None).unwrap();
        assert!(matches!(alloc.release(&"i1".into(), &db), Release::Released(_)));
        assert_eq!(alloc.free_slots(&db).unwrap(), before);

        // second release is a no-op
        assert_eq!(alloc.release(&"i1".into(), &db), Release::NotHeld);
        assert_eq!(alloc.release(&"i1".into(), &"nope".into()), Release::NotHeld);
        assert_eq!(alloc.free_slots(&db).unwrap(), before);
    }

    #[test]
    fn release_slot_ignores_stale_handles() {
        let alloc = allocator(&[("db-1", 3)]);
        let db = DatabaseId::new("db-1");
        let first_op = OperationId::new();
        let stale = alloc.reserve(&"i1".into(), &db, &req(), Some(first_op)).unwrap();
        alloc.release(&"i1".into(), &db);

        let fresh = alloc
            .reserve(&"i1".into(), &db, &req(), Some(OperationId::new()))
            .unwrap();
        assert_eq!(alloc.release_slot(&stale), Release::NotHeld);
        assert_eq!(alloc.holder(&"i1".into(), &db), Some(fresh.clone()));
        assert_eq!(alloc.release_slot(&fresh), Release::Released(fresh));
    }

    #[test]
    fn select_prefers_least_loaded_then_lowest_id() {
        let alloc = allocator(&[("db-b", 4), ("db-a", 4), ("db-c", 2)]);
        assert_eq!(alloc.select(&req(), true).unwrap(), DatabaseId::new("db-a"));

        alloc.reserve(&"i1".into(), &"db-a".into(), &req(), None).unwrap();
        assert_eq!(alloc.select(&req(), true).unwrap(), DatabaseId::new("db-b"));

        alloc.reserve(&"i2".into(), &"db-b".into(), &req(), None).unwrap();
        // db-a and db-b at 1/4, db-c at 0/2
        assert_eq!(alloc.select(&req(), true).unwrap(), DatabaseId::new("db-c"));

        alloc.reserve(&"i3".into(), &"db-c".into(), &req(), None).unwrap();
        // db-c at 1/2 is now more loaded than 1/4
        assert_eq!(alloc.select(&req(), true).unwrap(), DatabaseId::new("db-a"));
    }

    #[test]
    fn select_skips_full_and_incompatible() {
        let alloc = allocator(&[("db-1", 1)]);
        alloc
            .register_database(MultiTenantDatabase::new(
                "db-0",
                DatabaseKind::MultiTenantRdsMysql,
                10,
                "pg14",
            ))
            .unwrap();
        alloc.reserve(&"i1".into(), &"db-1".into(), &req(), None).unwrap();

        assert!(matches!(
            alloc.select(&req(), true),
            Err(AllocatorError::NoCapacityAvailable { .. })
        ));
        assert_eq!(alloc.select(&req(), false).unwrap(), DatabaseId::new("db-1"));
    }

    #[test]
    fn select_avoiding_skips_current_instance() {
        let alloc = allocator(&[("db-1", 4), ("db-2", 4)]);
        let current = DatabaseId::new("db-1");
        assert_eq!(
            alloc.select_avoiding(&req(), true, Some(&current)).unwrap(),
            DatabaseId::new("db-2")
        );

        let alloc = allocator(&[("db-1", 4)]);
        assert!(alloc.select_avoiding(&req(), true, Some(&current)).is_err());
    }

    #[test]
    fn admit_checks_without_reserving() {
        let alloc = allocator(&[("db-1", 1)]);
        let db = DatabaseId::new("db-1");
        assert_eq!(alloc.admit(&db, &req()).unwrap(), 1);
        assert_eq!(alloc.free_slots(&db).unwrap(), 1);

        assert!(matches!(
            alloc.admit(&db, &SlotRequirement::new(PG, "pg11")),
            Err(AllocatorError::IncompatibleBackend { .. })
        ));
        assert_eq!(
            alloc.admit(&"db-9".into(), &req()),
            Err(AllocatorError::DatabaseNotFound("db-9".into()))
        );

        alloc.reserve(&"i1".into(), &db, &req(), None).unwrap();
        assert_eq!(
            alloc.admit(&db, &req()),
            Err(AllocatorError::CapacityExhausted {
                database_id: db,
                capacity: 1
            })
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let alloc = allocator(&[("db-1", 1)]);
        let err = alloc
            .register_database(MultiTenantDatabase::new("db-1", PG, 1, "pg14"))
            .unwrap_err();
        assert_eq!(err, AllocatorError::DatabaseExists("db-1".into()));
    }
}
