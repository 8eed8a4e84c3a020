use dbmig_kernel::prelude::*;
use dbmig_test_utils::{Fault, Fixture, LifecycleCall};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn happy_path_reaches_committed() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));

    let migrated = fx.drive_until(id, MigrationState::Migrated).await;
    assert!(migrated.slot.is_some());
    assert_eq!(fx.installation("i1").status, InstallationStatus::Migrating);
    assert_eq!(fx.allocator.free_slots(&"db-1".into()).unwrap(), 1);

    // migrated waits for a decision
    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &migrated).await,
        ReconcileOutcome::Waiting(MigrationState::Migrated)
    );

    fx.decide(id, MigrationEvent::CommitRequested).unwrap();
    let committed = fx.drive_until(id, MigrationState::Committed).await;
    assert_eq!(committed.failure_reason, None);

    let installation = fx.installation("i1");
    assert_eq!(installation.status, InstallationStatus::Stable);
    assert_eq!(installation.backend.slot_database(), Some(&DatabaseId::new("db-1")));
    assert!(fx.allocator.holder(&"i1".into(), &"db-1".into()).is_some());
    assert_eq!(fx.copier.started(), 1);
    assert!(fx.store.active_for(&"i1".into()).is_none());
}

#[tokio::test]
async fn rollback_restores_source_and_frees_slot() {
    let fx = Fixture::standard(1, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Migrated).await;

    fx.decide(id, MigrationEvent::RollbackRequested).unwrap();
    fx.drive_until(id, MigrationState::RolledBack).await;

    let installation = fx.installation("i1");
    assert_eq!(installation.status, InstallationStatus::Stable);
    assert_eq!(installation.backend.slot_database(), None);
    assert_eq!(fx.allocator.total_occupied(), 0);
}

#[tokio::test]
async fn capacity_one_second_reservation_fails() {
    let fx = Fixture::standard(1, 2);
    let first = fx.request("i1", Some("db-1"));
    fx.clock.advance_millis(1);
    let second = fx.request("i2", Some("db-1"));

    // requested -> reserving for both
    assert_eq!(fx.pass().await.advanced, 2);
    // i1 is older and reserves first
    let report = fx.pass().await;
    assert_eq!(report.advanced, 1);
    assert_eq!(report.failures, 1);

    assert_eq!(fx.op(first).state, MigrationState::Quiescing);
    let loser = fx.op(second);
    assert_eq!(loser.state, MigrationState::Failed);
    assert!(loser
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("capacity exhausted on db-1"));
    assert_eq!(loser.attempts, 1);
    assert!(loser.slot.is_none());
    assert_eq!(fx.allocator.total_occupied(), 1);
}

#[tokio::test]
async fn rollback_after_commit_is_rejected() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Migrated).await;
    fx.decide(id, MigrationEvent::CommitRequested).unwrap();
    fx.drive_until(id, MigrationState::Committed).await;

    let err = fx.decide(id, MigrationEvent::RollbackRequested).unwrap_err();
    assert_eq!(
        err,
        MigrationError::Transition(TransitionError::InvalidStateForCancel(MigrationState::Committed))
    );
    assert_eq!(fx.op(id).state, MigrationState::Committed);
}

#[tokio::test]
async fn repeated_copy_failures_end_abandoned_without_dangling_slot() {
    let fx = Fixture::standard(1, 1);
    fx.copier.push_failures(3, "import failed");
    let id = fx.request("i1", Some("db-1"));

    let abandoned = fx.drive_until(id, MigrationState::Abandoned).await;
    assert_eq!(abandoned.attempts, 3);
    assert_eq!(abandoned.failure_reason.as_deref().map(|r| r.contains("import failed #3")), Some(true));
    assert!(abandoned.slot.is_none());
    assert_eq!(fx.allocator.total_occupied(), 0);
    assert_eq!(fx.copier.started(), 3);
    assert_eq!(fx.installation("i1").status, InstallationStatus::Stable);
}

#[tokio::test(start_paused = true)]
async fn racing_workers_only_one_takes_the_lease() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    let listed = fx.op(id);
    fx.lifecycle
        .set_fault(LifecycleCall::Installation, Fault::Delay(Duration::from_millis(50)));

    let other = fx.second_supervisor();
    let (w1, w2): (WorkerId, WorkerId) = ("w1".into(), "w2".into());
    let (a, b) = tokio::join!(
        fx.supervisor.reconcile(&w1, &listed),
        other.reconcile(&w2, &listed)
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|o| **o == ReconcileOutcome::Leased).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Advanced { .. }))
            .count(),
        1
    );
    let op = fx.op(id);
    assert_eq!(op.state, MigrationState::Reserving);
    assert_eq!(op.version, 2);
    assert!(fx.leases.holder(&"i1".into()).is_none());
}

#[tokio::test]
async fn stale_listing_is_skipped_without_mutation() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    let listed = fx.op(id);
    fx.pass().await;

    let before = fx.op(id);
    assert_eq!(fx.supervisor.reconcile(&fx.worker, &listed).await, ReconcileOutcome::Stale);
    assert_eq!(fx.op(id), before);
}

#[tokio::test]
async fn held_lease_is_respected_until_expiry() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.leases
        .acquire(&"i1".into(), &"crashed-worker".into(), 1_000)
        .unwrap();

    let listed = fx.op(id);
    assert_eq!(fx.supervisor.reconcile(&fx.worker, &listed).await, ReconcileOutcome::Leased);
    assert_eq!(fx.op(id).version, 1);

    fx.clock.advance_millis(1_001);
    assert!(matches!(
        fx.supervisor.reconcile(&fx.worker, &listed).await,
        ReconcileOutcome::Advanced { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn hung_call_times_out_into_failed() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Quiescing).await;
    fx.lifecycle.set_fault(LifecycleCall::Quiesce, Fault::Hang);

    let outcome = fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Failed { state: MigrationState::Quiescing, .. }
    ));

    let op = fx.op(id);
    assert_eq!(op.state, MigrationState::Failed);
    assert!(op.failure_reason.unwrap().contains("quiesce timed out after 200ms"));
    assert_eq!(fx.allocator.total_occupied(), 0);
    assert!(fx.leases.holder(&"i1".into()).is_none());
}

#[tokio::test]
async fn panicking_handler_fails_operation_and_releases_lease() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Quiescing).await;
    fx.lifecycle
        .set_fault(LifecycleCall::Quiesce, Fault::Panic("controller exploded"));

    let outcome = fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await;
    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert!(fx.leases.holder(&"i1".into()).is_none());

    let op = fx.op(id);
    assert_eq!(op.state, MigrationState::Failed);
    assert!(op.failure_reason.unwrap().contains("controller exploded"));

    // recovers once the controller behaves
    fx.lifecycle.clear_faults();
    fx.drive_until(id, MigrationState::Migrated).await;
}

#[tokio::test]
async fn quiesce_that_never_completes_hits_wait_limit() {
    let fx = Fixture::builder()
        .database("db-1", 2)
        .installation("i1")
        .quiesce_polls(u32::MAX)
        .config(dbmig_test_utils::test_config().with_wait_timeouts_ms(1_000, 1_000))
        .build();
    let id = fx.request("i1", Some("db-1"));
    let quiescing = fx.drive_until(id, MigrationState::Quiescing).await;

    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &quiescing).await,
        ReconcileOutcome::Waiting(MigrationState::Quiescing)
    );
    fx.clock.advance_millis(1_000);
    let outcome = fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await;
    assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
    assert!(fx
        .op(id)
        .failure_reason
        .unwrap()
        .contains("quiesce timed out after 1000ms"));
}

#[tokio::test]
async fn copy_in_progress_is_polled_again() {
    let fx = Fixture::standard(2, 1);
    fx.copier.push(CopyStatus::InProgress);
    fx.copier.push(CopyStatus::InProgress);
    let id = fx.request("i1", Some("db-1"));
    let copying = fx.drive_until(id, MigrationState::Copying).await;

    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &copying).await,
        ReconcileOutcome::Waiting(MigrationState::Copying)
    );
    fx.drive_until(id, MigrationState::Migrated).await;
    assert_eq!(fx.copier.started(), 1);
}

#[tokio::test]
async fn finalize_failure_is_retried_in_place() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Migrated).await;
    fx.decide(id, MigrationEvent::CommitRequested).unwrap();
    fx.lifecycle.set_fault(
        LifecycleCall::Repoint,
        Fault::Error(DependencyError::Lifecycle("api down".into())),
    );

    let outcome = fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Failed { state: MigrationState::Committing, .. }
    ));
    let op = fx.op(id);
    assert_eq!(op.state, MigrationState::Committing);
    assert!(op.failure_reason.unwrap().contains("api down"));
    assert_eq!(op.attempts, 0);

    fx.lifecycle.clear_faults();
    let committed = fx.drive_until(id, MigrationState::Committed).await;
    assert_eq!(committed.failure_reason, None);
}

#[tokio::test]
async fn leftover_reservation_for_same_operation_is_adopted() {
    let fx = Fixture::standard(1, 1);
    let id = fx.request("i1", Some("db-1"));
    fx.drive_until(id, MigrationState::Reserving).await;

    // a previous attempt reserved but never recorded it
    fx.allocator
        .reserve(
            &"i1".into(),
            &"db-1".into(),
            &SlotRequirement::new(DatabaseKind::MultiTenantRdsPostgres, "pg-14"),
            Some(id),
        )
        .unwrap();

    let op = fx.drive_until(id, MigrationState::Quiescing).await;
    assert_eq!(op.slot.unwrap().operation_id, Some(id));
    assert_eq!(fx.allocator.total_occupied(), 1);
}

#[tokio::test]
async fn unpinned_destination_is_reselected_after_failure() {
    let fx = Fixture::builder()
        .database("db-a", 2)
        .database("db-b", 2)
        .installation("i1")
        .installation("i2")
        .build();
    fx.copier.push(CopyStatus::Failed("disk full".into()));

    let id = fx.request("i1", None);
    let reserved = fx.drive_until(id, MigrationState::Quiescing).await;
    assert_eq!(reserved.destination.database_id, Some("db-a".into()));
    assert!(!reserved.destination_pinned);

    let failed = fx.drive_until(id, MigrationState::Failed).await;
    assert_eq!(failed.destination.database_id, None);

    // load db-a so the retry lands elsewhere
    let other = fx.request("i2", Some("db-a"));
    fx.drive_until(other, MigrationState::Quiescing).await;

    let retried = fx.drive_until(id, MigrationState::Migrated).await;
    assert_eq!(retried.destination.database_id, Some("db-b".into()));
}

#[tokio::test]
async fn failed_operation_waits_for_backoff() {
    let fx = Fixture::standard(1, 1);
    fx.copier.push(CopyStatus::Failed("transient".into()));
    let id = fx.request("i1", Some("db-1"));
    let failed = fx.drive_until(id, MigrationState::Failed).await;

    let retry_at = failed.next_attempt_at.unwrap();
    fx.clock.set_millis(retry_at - 1);
    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await,
        ReconcileOutcome::Waiting(MigrationState::Failed)
    );
    fx.clock.set_millis(retry_at);
    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &fx.op(id)).await,
        ReconcileOutcome::Advanced {
            from: MigrationState::Failed,
            to: MigrationState::Requested
        }
    );
}

#[tokio::test(start_paused = true)]
async fn worker_pool_drives_operations_and_stops_on_shutdown() {
    let fx = Fixture::builder()
        .database("db-1", 4)
        .installation("i1")
        .installation("i2")
        .installation("i3")
        .config(dbmig_test_utils::test_config().with_poll_interval_ms(10))
        .build();
    let ids: Vec<_> = ["i1", "i2", "i3"]
        .iter()
        .map(|i| fx.request(i, Some("db-1")))
        .collect();

    let (stop, shutdown) = watch::channel(false);
    let pool = tokio::spawn(Arc::clone(&fx.supervisor).run(shutdown));

    for _ in 0..200 {
        if ids.iter().all(|id| fx.op(*id).state == MigrationState::Migrated) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for id in &ids {
        assert_eq!(fx.op(*id).state, MigrationState::Migrated);
    }
    assert_eq!(fx.allocator.total_occupied(), 3);
    assert_eq!(fx.copier.started(), 3);

    stop.send(true).unwrap();
    pool.await.unwrap();
}

#[tokio::test]
async fn lease_expiring_mid_handler_stops_before_the_copy_starts() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    let quiescing = fx.drive_until(id, MigrationState::Quiescing).await;

    // the pause call outlives the lease
    let ttl = i64::try_from(fx.supervisor.config().lease_ttl_ms).unwrap();
    fx.lifecycle
        .set_fault(LifecycleCall::Quiesce, Fault::AdvanceClock(ttl + 1));
    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &quiescing).await,
        ReconcileOutcome::Leased
    );
    assert_eq!(fx.copier.started(), 0);
    let untouched = fx.op(id);
    assert_eq!(untouched.state, MigrationState::Quiescing);
    assert_eq!(untouched.version, quiescing.version);
    assert_eq!(untouched.failure_reason, None);

    // the next holder finds the installation paused and starts the one copy
    fx.lifecycle.clear_faults();
    let other = fx.second_supervisor();
    assert!(matches!(
        other.reconcile(&"w2".into(), &untouched).await,
        ReconcileOutcome::Advanced { to: MigrationState::Copying, .. }
    ));
    assert_eq!(fx.copier.started(), 1);
}

#[tokio::test]
async fn slow_calls_within_the_lease_keep_renewing_it() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    let quiescing = fx.drive_until(id, MigrationState::Quiescing).await;

    // each call eats most of the lease; renewal before the next call keeps it alive
    let ttl = i64::try_from(fx.supervisor.config().lease_ttl_ms).unwrap();
    fx.lifecycle
        .set_fault(LifecycleCall::Quiesce, Fault::AdvanceClock(ttl - 1));
    assert!(matches!(
        fx.supervisor.reconcile(&fx.worker, &quiescing).await,
        ReconcileOutcome::Advanced { to: MigrationState::Copying, .. }
    ));
    assert_eq!(fx.copier.started(), 1);
}

#[tokio::test]
async fn copy_started_before_a_lost_race_is_reattached() {
    let fx = Fixture::standard(2, 1);
    let id = fx.request("i1", Some("db-1"));
    let quiescing = fx.drive_until(id, MigrationState::Quiescing).await;

    // another writer moves the record between starting the copy and recording it
    let store = Arc::clone(&fx.store);
    fx.copier.after_next_start(move || {
        let current = store.get(id).unwrap();
        store
            .compare_and_swap(id, current.version, &mut |_| Ok(()))
            .unwrap();
    });
    assert_eq!(
        fx.supervisor.reconcile(&fx.worker, &quiescing).await,
        ReconcileOutcome::Conflict
    );
    assert_eq!(fx.op(id).state, MigrationState::Quiescing);
    assert_eq!(fx.copier.started(), 1);

    let copying = fx.drive_until(id, MigrationState::Copying).await;
    assert_eq!(fx.copier.started(), 1);
    assert_eq!(copying.copy_job, fx.copier.jobs().first().cloned());
}

#[tokio::test]
async fn unresumable_installation_still_ends_abandoned_with_the_copy_error() {
    let fx = Fixture::standard(2, 1);
    fx.copier.push_failures(1, "disk full");
    fx.lifecycle.set_fault(
        LifecycleCall::Resume,
        Fault::Error(DependencyError::InstallationNotFound("i1".into())),
    );
    let id = fx.request("i1", Some("db-1"));

    let abandoned = fx.drive_until(id, MigrationState::Abandoned).await;
    assert!(abandoned.failure_reason.unwrap().contains("disk full #1"));
    assert_eq!(abandoned.attempts, fx.supervisor.config().max_attempts);
    assert_eq!(fx.copier.started(), 1);
    assert_eq!(fx.allocator.total_occupied(), 0);
    assert!(fx.store.active_for(&"i1".into()).is_none());
}
