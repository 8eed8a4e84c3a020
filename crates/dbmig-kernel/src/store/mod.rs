//! Migration operation store
//!
//! Every state change goes through [`OperationStore::compare_and_swap`]: the
//! caller names the version it read, the mutator runs against a copy, and the
//! copy replaces the stored record only if the version still matches. The
//! store also owns the one-active-operation-per-installation index.

use crate::clock::Clock;
use crate::state_machine;
use dbmig_model::{
    InstallationId, MigrationError, MigrationOperation, OperationFilter, OperationId, StoreError,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Mutation applied inside a compare-and-swap
pub type Mutator<'a> = &'a mut dyn FnMut(&mut MigrationOperation) -> Result<(), MigrationError>;

/// Durable record of migration operations
pub trait OperationStore: Send + Sync + std::fmt::Debug {
    /// Insert a new operation
    ///
    /// # Errors
    /// - `StoreError::ConflictingOperation` if the installation has an active operation
    fn create(&self, op: MigrationOperation) -> Result<OperationId, StoreError>;

    /// Fetch one operation
    ///
    /// # Errors
    /// - `StoreError::NotFound` for an unknown id
    fn get(&self, id: OperationId) -> Result<MigrationOperation, StoreError>;

    /// Filtered, paged listing, newest first
    fn list(&self, filter: &OperationFilter) -> Vec<MigrationOperation>;

    /// Every non-terminal operation, oldest first
    fn list_active(&self) -> Vec<MigrationOperation>;

    /// The active operation for an installation
    fn active_for(&self, installation: &InstallationId) -> Option<MigrationOperation>;

    /// Optimistic update; returns the record as stored after the swap
    ///
    /// # Errors
    /// - `StoreError::NotFound` for an unknown id
    /// - `StoreError::VersionConflict` if `expected_version` is stale
    /// - `StoreError::Immutable` if the operation is terminal
    /// - whatever the mutator returns; the record is left untouched
    fn compare_and_swap(
        &self,
        id: OperationId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<MigrationOperation, MigrationError>;

    /// Copy of every record
    fn snapshot(&self) -> Vec<MigrationOperation>;
}

#[derive(Debug, Default)]
struct Inner {
    operations: BTreeMap<OperationId, MigrationOperation>,
    active: HashMap<InstallationId, OperationId>,
}

/// In-memory store; persisted through [`OperationStore::snapshot`]
#[derive(Debug)]
pub struct InMemoryOperationStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOperationStore {
    /// Empty store
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    /// Store rebuilt from persisted records
    ///
    /// # Errors
    /// - `StoreError::Persistence` if two records are active for one installation
    pub fn from_operations(
        operations: impl IntoIterator<Item = MigrationOperation>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let mut inner = Inner::default();
        for op in operations {
            if op.state.is_active() {
                if let Some(existing) = inner.active.insert(op.installation_id.clone(), op.id) {
                    return Err(StoreError::Persistence(format!(
                        "installation {} has two active operations: {} and {}",
                        op.installation_id, existing, op.id
                    )));
                }
            }
            inner.operations.insert(op.id, op);
        }
        Ok(Self {
            inner: RwLock::new(inner),
            clock,
        })
    }

    /// Take `op` if it is newer than the stored copy; returns whether it was taken
    ///
    /// Folds in records another process wrote. Versions only grow, so the
    /// higher one is the later write; on a tie the stored copy stays. A record
    /// that would give its installation a second active operation is refused.
    pub fn absorb(&self, op: MigrationOperation) -> bool {
        let mut inner = self.inner.write();
        if inner
            .operations
            .get(&op.id)
            .is_some_and(|current| current.version >= op.version)
        {
            return false;
        }

        match inner.active.get(&op.installation_id).copied() {
            Some(existing) if op.state.is_active() && existing != op.id => {
                tracing::warn!(
                    operation = %op.id,
                    installation = %op.installation_id,
                    existing = %existing,
                    "refusing second active operation"
                );
                return false;
            }
            Some(existing) if !op.state.is_active() && existing == op.id => {
                inner.active.remove(&op.installation_id);
            }
            _ if op.state.is_active() => {
                inner.active.insert(op.installation_id.clone(), op.id);
            }
            _ => {}
        }
        inner.operations.insert(op.id, op);
        true
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().operations.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OperationStore for InMemoryOperationStore {
    fn create(&self, mut op: MigrationOperation) -> Result<OperationId, StoreError> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.active.get(&op.installation_id) {
            return Err(StoreError::ConflictingOperation {
                installation_id: op.installation_id.clone(),
                existing: *existing,
            });
        }

        op.version = 1;
        let id = op.id;
        if op.state.is_active() {
            inner.active.insert(op.installation_id.clone(), id);
        }
        inner.operations.insert(id, op);
        Ok(id)
    }

    fn get(&self, id: OperationId) -> Result<MigrationOperation, StoreError> {
        self.inner
            .read()
            .operations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self, filter: &OperationFilter) -> Vec<MigrationOperation> {
        let inner = self.inner.read();
        let mut matching: Vec<&MigrationOperation> = inner
            .operations
            .values()
            .filter(|op| filter.matches(op))
            .collect();
        matching.sort_by(|a, b| b.request_at.cmp(&a.request_at).then_with(|| b.id.cmp(&a.id)));
        filter.paging.apply(matching.into_iter().cloned())
    }

    fn list_active(&self) -> Vec<MigrationOperation> {
        let inner = self.inner.read();
        let mut active: Vec<MigrationOperation> = inner
            .active
            .values()
            .filter_map(|id| inner.operations.get(id).cloned())
            .collect();
        active.sort_by(|a, b| a.request_at.cmp(&b.request_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    fn active_for(&self, installation: &InstallationId) -> Option<MigrationOperation> {
        let inner = self.inner.read();
        inner
            .active
            .get(installation)
            .and_then(|id| inner.operations.get(id).cloned())
    }

    fn compare_and_swap(
        &self,
        id: OperationId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<MigrationOperation, MigrationError> {
        let mut inner = self.inner.write();
        let current = inner.operations.get(&id).ok_or(StoreError::NotFound(id))?;

        if current.state.is_terminal() {
            return Err(StoreError::Immutable {
                id,
                state: current.state,
            }
            .into());
        }
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            }
            .into());
        }

        let mut updated = current.clone();
        mutator(&mut updated)?;

        // identity fields are not the mutator's to change
        updated.id = current.id;
        updated.installation_id = current.installation_id.clone();
        updated.request_at = current.request_at;
        state_machine::validate_transition(current.state, updated.state)?;

        if updated.state != current.state {
            updated.last_transition_at = self.clock.now_millis();
        }
        updated.version = current.version + 1;

        if updated.state.is_terminal() {
            inner.active.remove(&updated.installation_id);
        }
        inner.operations.insert(id, updated.clone());
        Ok(updated)
    }

    fn snapshot(&self) -> Vec<MigrationOperation> {
        self.inner.read().operations.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use dbmig_model::{BackendDescriptor, DatabaseKind, MigrationState, Paging, TransitionError};

    fn op(installation: &str, at: i64) -> MigrationOperation {
        MigrationOperation::new(
            installation.into(),
            BackendDescriptor::dedicated(DatabaseKind::MysqlOperator),
            BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1"),
            at,
        )
    }

    fn store() -> (InMemoryOperationStore, ManualClock) {
        let clock = ManualClock::new(1_000);
        (InMemoryOperationStore::new(Arc::new(clock.clone())), clock)
    }

    fn set_state(state: MigrationState) -> impl FnMut(&mut MigrationOperation) -> Result<(), MigrationError> {
        move |op| {
            op.state = state;
            Ok(())
        }
    }

    #[test]
    fn second_active_operation_conflicts() {
        let (store, _) = store();
        let first = store.create(op("i1", 1)).unwrap();
        let err = store.create(op("i1", 2)).unwrap_err();
        assert_eq!(
            err,
            StoreError::ConflictingOperation {
                installation_id: "i1".into(),
                existing: first
            }
        );
        assert!(store.create(op("i2", 3)).is_ok());
    }

    #[test]
    fn cas_bumps_version_and_stamps_transition_time() {
        let (store, clock) = store();
        let id = store.create(op("i1", 1)).unwrap();
        clock.advance_millis(500);

        let updated = store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Reserving))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.state, MigrationState::Reserving);
        assert_eq!(updated.last_transition_at, 1_500);
        assert_eq!(store.get(id).unwrap(), updated);
    }

    #[test]
    fn stale_version_is_rejected_without_mutation() {
        let (store, _) = store();
        let id = store.create(op("i1", 1)).unwrap();
        store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Reserving))
            .unwrap();

        let err = store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Quiescing))
            .unwrap_err();
        assert_eq!(
            err,
            MigrationError::Store(StoreError::VersionConflict {
                id,
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(store.get(id).unwrap().state, MigrationState::Reserving);
    }

    #[test]
    fn mutator_errors_leave_record_untouched() {
        let (store, _) = store();
        let id = store.create(op("i1", 1)).unwrap();
        let err = store
            .compare_and_swap(id, 1, &mut |op: &mut MigrationOperation| {
                op.failure_reason = Some("scribbled".into());
                Err(TransitionError::InvalidStateForCancel(op.state).into())
            })
            .unwrap_err();
        assert!(matches!(err, MigrationError::Transition(_)));
        let stored = store.get(id).unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.failure_reason.is_none());
    }

    #[test]
    fn backwards_state_changes_are_rejected() {
        let (store, _) = store();
        let id = store.create(op("i1", 1)).unwrap();
        let err = store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Migrated))
            .unwrap_err();
        assert!(matches!(err, MigrationError::Transition(_)));
    }

    #[test]
    fn terminal_records_are_immutable_and_free_the_installation() {
        let (store, _) = store();
        let id = store.create(op("i1", 1)).unwrap();
        store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Reserving))
            .unwrap();
        store
            .compare_and_swap(id, 2, &mut set_state(MigrationState::Failed))
            .unwrap();
        store
            .compare_and_swap(id, 3, &mut set_state(MigrationState::Abandoned))
            .unwrap();

        let err = store
            .compare_and_swap(id, 4, &mut set_state(MigrationState::Abandoned))
            .unwrap_err();
        assert!(matches!(err, MigrationError::Store(StoreError::Immutable { .. })));

        assert!(store.active_for(&"i1".into()).is_none());
        assert!(store.create(op("i1", 5)).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn list_is_newest_first_with_filters_and_paging() {
        let (store, _) = store();
        for (i, installation) in ["a", "b", "c", "d"].iter().enumerate() {
            store.create(op(installation, i as i64 * 10)).unwrap();
        }

        let all: Vec<_> = store
            .list(&OperationFilter::all())
            .into_iter()
            .map(|op| op.installation_id.to_string())
            .collect();
        assert_eq!(all, vec!["d", "c", "b", "a"]);

        let page: Vec<_> = store
            .list(&OperationFilter::all().with_paging(Paging::new(1, 2)))
            .into_iter()
            .map(|op| op.installation_id.to_string())
            .collect();
        assert_eq!(page, vec!["b", "a"]);

        assert_eq!(store.list(&OperationFilter::all().with_installation("c")).len(), 1);
        assert_eq!(
            store
                .list(&OperationFilter::all().with_state(MigrationState::Committed))
                .len(),
            0
        );
    }

    #[test]
    fn absorb_takes_only_newer_records() {
        let (store, _) = store();
        let id = store.create(op("i1", 1)).unwrap();
        let v1 = store.get(id).unwrap();
        let v2 = store
            .compare_and_swap(id, 1, &mut set_state(MigrationState::Reserving))
            .unwrap();

        assert!(!store.absorb(v1));
        assert!(!store.absorb(v2.clone()));
        assert_eq!(store.get(id).unwrap(), v2);

        let mut v3 = v2;
        v3.state = MigrationState::Failed;
        v3.version = 3;
        assert!(store.absorb(v3.clone()));
        assert_eq!(store.get(id).unwrap(), v3);

        let mut done = v3;
        done.state = MigrationState::Abandoned;
        done.version = 4;
        assert!(store.absorb(done));
        assert!(store.active_for(&"i1".into()).is_none());
    }

    #[test]
    fn absorb_adds_unknown_records_but_not_a_second_active_one() {
        let (store, _) = store();
        let fresh = op("i1", 1);
        let fresh_id = fresh.id;
        assert!(store.absorb(fresh));
        assert_eq!(store.active_for(&"i1".into()).map(|op| op.id), Some(fresh_id));

        assert!(!store.absorb(op("i1", 2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn restore_rejects_duplicate_active_records() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let err = InMemoryOperationStore::from_operations(vec![op("i1", 1), op("i1", 2)], clock)
            .unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
    }

    #[test]
    fn snapshot_round_trip_preserves_active_index() {
        let (store, _) = store();
        store.create(op("i1", 1)).unwrap();
        let restored = InMemoryOperationStore::from_operations(
            store.snapshot(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert!(restored.active_for(&"i1".into()).is_some());
        assert!(matches!(
            restored.create(op("i1", 2)),
            Err(StoreError::ConflictingOperation { .. })
        ));
    }
}
