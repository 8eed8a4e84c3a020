use dbmig_kernel::clock::{Clock, ManualClock};
use dbmig_kernel::state_machine::{apply, MigrationEvent};
use dbmig_kernel::store::{InMemoryOperationStore, OperationStore};
use dbmig_model::{
    BackendDescriptor, DatabaseKind, InstallationId, MigrationError, MigrationOperation,
    MigrationState, OperationFilter, StoreError,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn store() -> (Arc<InMemoryOperationStore>, ManualClock) {
    let clock = ManualClock::new(1_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (Arc::new(InMemoryOperationStore::new(shared)), clock)
}

fn new_op(installation: &str, now: i64) -> MigrationOperation {
    MigrationOperation::new(
        InstallationId::new(installation),
        BackendDescriptor::dedicated(DatabaseKind::SingleTenantRdsPostgres),
        BackendDescriptor::multi_tenant(DatabaseKind::MultiTenantRdsPostgres, "db-1"),
        now,
    )
}

/// Walk an operation straight to a terminal state
fn finish(store: &InMemoryOperationStore, op: &MigrationOperation) {
    let events = [
        MigrationEvent::Begin,
        MigrationEvent::SlotReserved,
        MigrationEvent::InstallationPaused,
        MigrationEvent::CopySucceeded,
        MigrationEvent::RollbackRequested,
        MigrationEvent::RestoreSucceeded,
    ];
    for event in events {
        let current = store.get(op.id).unwrap();
        store
            .compare_and_swap(op.id, current.version, &mut |record| {
                record.state = apply(record.state, event)?.state();
                Ok(())
            })
            .unwrap();
    }
}

#[test]
fn concurrent_creates_for_one_installation_admit_one() {
    let (store, _) = store();
    let accepted: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| store.create(new_op("i1", 1_000)).is_ok()))
            .collect();
        handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum()
    });
    assert_eq!(accepted, 1);
    assert_eq!(store.list(&OperationFilter::all()).len(), 1);
}

#[test]
fn racing_swaps_on_one_version_admit_one() {
    let (store, _) = store();
    let id = store.create(new_op("i1", 1_000)).unwrap();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    store.compare_and_swap(id, 1, &mut |record| {
                        record.state = apply(record.state, MigrationEvent::Begin)?.state();
                        Ok(())
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(MigrationError::Store(StoreError::VersionConflict { expected: 1, actual: 2, .. }))
    )));
    assert_eq!(store.get(id).unwrap().version, 2);
}

#[test]
fn terminal_record_frees_installation_and_is_retained() {
    let (store, clock) = store();
    let first = new_op("i1", clock.now_millis());
    store.create(first.clone()).unwrap();
    finish(&store, &first);

    clock.advance_millis(10);
    let second = store.create(new_op("i1", clock.now_millis())).unwrap();
    let listed = store.list(&OperationFilter::all().with_installation("i1"));
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second);
    assert_eq!(listed[1].state, MigrationState::RolledBack);
}

proptest! {
    #[test]
    fn prop_at_most_one_active_per_installation(
        steps in proptest::collection::vec((0..4usize, any::<bool>()), 1..60)
    ) {
        let (store, clock) = store();
        let mut created: Vec<MigrationOperation> = Vec::new();

        for (installation, finish_one) in steps {
            clock.advance_millis(1);
            let op = new_op(&format!("i{installation}"), clock.now_millis());
            match store.create(op.clone()) {
                Ok(_) => created.push(op),
                Err(StoreError::ConflictingOperation { existing, .. }) => {
                    let active = store.active_for(&op.installation_id).unwrap();
                    prop_assert_eq!(active.id, existing);
                    if finish_one {
                        finish(&store, &active);
                    }
                }
                Err(other) => prop_assert!(false, "unexpected {other}"),
            }

            let mut active: HashMap<InstallationId, usize> = HashMap::new();
            for op in store.list(&OperationFilter::all()) {
                if op.state.is_active() {
                    *active.entry(op.installation_id).or_default() += 1;
                }
            }
            prop_assert!(active.values().all(|count| *count <= 1));
        }
        prop_assert_eq!(store.len(), created.len());
    }
}
