//! Reconciliation supervisor
//!
//! Drives every non-terminal migration operation toward completion. One pass
//! ([`Supervisor::run_once`]) lists active operations and reconciles each:
//!
//! 1. take the installation's lease (skip if another worker holds it)
//! 2. re-read the operation and skip it if its version moved since listing
//! 3. run the handler for its state; each external call first renews the
//!    lease and then runs under a timeout
//! 4. drop the lease, also when the handler panicked
//!
//! A handler error, timeout or panic moves the operation to `failed` with a
//! reason (or, past the decision point, records the reason and retries in
//! place). Losing the lease mid-handler ends the pass without recording
//! anything; the new holder owns the operation. [`Supervisor::spawn`] runs
//! passes on a pool of tokio workers.

mod handlers;

use crate::allocator::CapacityAllocator;
use crate::clock::Clock;
use crate::collaborators::{CopyExecutor, LifecycleController};
use crate::config::SupervisorConfig;
use crate::lease::{LeaseGuard, LeaseTable};
use crate::state_machine::{self, MigrationEvent};
use crate::store::OperationStore;
use dbmig_model::{
    AllocatorError, DependencyError, LeaseError, MigrationError, MigrationOperation,
    MigrationState, StoreError, WorkerId,
};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of reconciling one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// State changed
    Advanced {
        /// State before
        from: MigrationState,
        /// State after
        to: MigrationState,
    },
    /// Nothing to do yet
    Waiting(MigrationState),
    /// Another worker holds the lease, or it was lost mid-handler
    Leased,
    /// Operation changed since it was listed
    Stale,
    /// Handler failed; the reason was recorded
    Failed {
        /// State the handler ran in
        state: MigrationState,
        /// Recorded reason
        reason: String,
    },
    /// Lost a compare-and-swap race; picked up again next pass
    Conflict,
}

/// Tally of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Operations looked at
    pub examined: usize,
    /// Operations that changed state
    pub advanced: usize,
    /// Operations waiting on an answer, a backoff or a decision
    pub waiting: usize,
    /// Skipped: leased elsewhere, stale or lost a race
    pub skipped: usize,
    /// Handler failures recorded
    pub failures: usize,
}

impl ReconcileReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.examined += 1;
        match outcome {
            ReconcileOutcome::Advanced { .. } => self.advanced += 1,
            ReconcileOutcome::Waiting(_) => self.waiting += 1,
            ReconcileOutcome::Leased | ReconcileOutcome::Stale | ReconcileOutcome::Conflict => {
                self.skipped += 1;
            }
            ReconcileOutcome::Failed { .. } => self.failures += 1,
        }
    }
}

/// Reconciliation supervisor
#[derive(Debug)]
pub struct Supervisor {
    store: Arc<dyn OperationStore>,
    allocator: Arc<CapacityAllocator>,
    leases: Arc<LeaseTable>,
    lifecycle: Arc<dyn LifecycleController>,
    copier: Arc<dyn CopyExecutor>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Supervisor with its own lease table
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        allocator: Arc<CapacityAllocator>,
        lifecycle: Arc<dyn LifecycleController>,
        copier: Arc<dyn CopyExecutor>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Self {
        let leases = Arc::new(LeaseTable::new(Arc::clone(&clock)));
        Self {
            store,
            allocator,
            leases,
            lifecycle,
            copier,
            clock,
            config,
        }
    }

    /// Share a lease table with other supervisors
    #[must_use]
    pub fn with_leases(mut self, leases: Arc<LeaseTable>) -> Self {
        self.leases = leases;
        self
    }

    /// Operation store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// Capacity allocator
    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &Arc<CapacityAllocator> {
        &self.allocator
    }

    /// Lease table
    #[inline]
    #[must_use]
    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Reconcile every active operation once, oldest first
    pub async fn run_once(&self, worker: &WorkerId) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for op in self.store.list_active() {
            let outcome = self.reconcile(worker, &op).await;
            report.record(&outcome);
        }
        report
    }

    /// Reconcile one operation as listed
    pub async fn reconcile(&self, worker: &WorkerId, listed: &MigrationOperation) -> ReconcileOutcome {
        let guard = match self.leases.acquire_guard(
            &listed.installation_id,
            worker,
            self.config.lease_ttl_ms,
        ) {
            Ok(guard) => guard,
            Err(err) => {
                tracing::debug!(operation = %listed.id, error = %err, "lease unavailable, skipping");
                return ReconcileOutcome::Leased;
            }
        };

        let current = match self.store.get(listed.id) {
            Ok(op) if op.version == listed.version => op,
            Ok(op) => {
                tracing::debug!(
                    operation = %listed.id,
                    listed = listed.version,
                    current = op.version,
                    "operation changed since listing, skipping"
                );
                return ReconcileOutcome::Stale;
            }
            Err(err) => {
                tracing::warn!(operation = %listed.id, error = %err, "operation vanished");
                return ReconcileOutcome::Stale;
            }
        };

        let handled = AssertUnwindSafe(self.handle(&current, &guard))
            .catch_unwind()
            .await;
        let result = match handled {
            Ok(result) => result,
            Err(payload) => Err(MigrationError::Panicked(panic_message(payload.as_ref()))),
        };

        match result {
            Ok(outcome) => {
                if let ReconcileOutcome::Advanced { from, to } = &outcome {
                    tracing::info!(
                        operation = %current.id,
                        installation = %current.installation_id,
                        from = %from,
                        to = %to,
                        "operation advanced"
                    );
                }
                outcome
            }
            Err(MigrationError::Store(StoreError::VersionConflict { .. })) => {
                tracing::debug!(operation = %current.id, "lost compare-and-swap race");
                ReconcileOutcome::Conflict
            }
            Err(MigrationError::Lease(err)) => {
                tracing::warn!(
                    operation = %current.id,
                    installation = %current.installation_id,
                    error = %err,
                    "lease lost mid-handler, abandoning pass"
                );
                ReconcileOutcome::Leased
            }
            Err(err) => self.record_failure(&current, &err, &guard).await,
        }
    }

    /// Spawn `config.workers` polling tasks that stop when `shutdown` flips to true
    pub fn spawn(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|_| {
                let supervisor = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { supervisor.worker_loop(WorkerId::generate(), shutdown).await })
            })
            .collect()
    }

    /// Run the worker pool until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let handles = self.spawn(&shutdown);
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "supervisor worker exited abnormally");
            }
        }
    }

    async fn worker_loop(&self, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %worker, "supervisor worker started");
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once(&worker).await;
                    if report.advanced > 0 || report.failures > 0 {
                        tracing::debug!(
                            worker = %worker,
                            advanced = report.advanced,
                            failures = report.failures,
                            "pass complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker = %worker, "supervisor worker stopped");
    }

    /// Renew the lease, then run an external call under the configured deadline
    ///
    /// The call never starts once the lease is gone.
    async fn call<T>(
        &self,
        lease: &LeaseGuard,
        call: &'static str,
        fut: impl Future<Output = Result<T, DependencyError>> + Send,
    ) -> Result<T, MigrationError> {
        self.hold(lease)?;
        match tokio::time::timeout(self.config.call_timeout(), fut).await {
            Ok(result) => result.map_err(MigrationError::from),
            Err(_) => Err(DependencyError::Timeout {
                call,
                duration_ms: self.config.call_timeout_ms,
            }
            .into()),
        }
    }

    fn hold(&self, lease: &LeaseGuard) -> Result<(), LeaseError> {
        lease.renew(self.config.lease_ttl_ms).map(|_| ())
    }

    /// Apply `event` through compare-and-swap, running `update` on the new record
    fn transition(
        &self,
        op: &MigrationOperation,
        event: MigrationEvent,
        mut update: impl FnMut(&mut MigrationOperation),
    ) -> Result<ReconcileOutcome, MigrationError> {
        let from = op.state;
        let stored = self.store.compare_and_swap(op.id, op.version, &mut |record| {
            let transition = state_machine::apply(record.state, event)?;
            record.state = transition.state();
            update(record);
            Ok(())
        })?;
        if stored.state == from {
            return Ok(ReconcileOutcome::Waiting(from));
        }
        Ok(ReconcileOutcome::Advanced {
            from,
            to: stored.state,
        })
    }

    /// Record a handler failure against the latest version of `op`
    async fn record_failure(
        &self,
        op: &MigrationOperation,
        err: &MigrationError,
        lease: &LeaseGuard,
    ) -> ReconcileOutcome {
        let reason = err.to_string();
        let latest = match self.store.get(op.id) {
            Ok(latest) if !latest.state.is_terminal() => latest,
            _ => return ReconcileOutcome::Stale,
        };

        let result = match failure_event(latest.state, err) {
            Some(event) => self.fail(&latest, event, &reason, lease).await,
            None if latest.state == MigrationState::Failed => self.defer_retry(&latest),
            None => self.note_failure(&latest, &reason),
        };

        match result {
            Ok(_) => {
                tracing::warn!(
                    operation = %latest.id,
                    installation = %latest.installation_id,
                    state = %latest.state,
                    retryable = err.is_retryable(),
                    error = %reason,
                    "handler failed"
                );
                ReconcileOutcome::Failed {
                    state: latest.state,
                    reason,
                }
            }
            Err(MigrationError::Store(StoreError::VersionConflict { .. })) => ReconcileOutcome::Conflict,
            Err(MigrationError::Lease(_)) => ReconcileOutcome::Leased,
            Err(record_err) => {
                tracing::error!(
                    operation = %latest.id,
                    error = %record_err,
                    "could not record handler failure"
                );
                ReconcileOutcome::Conflict
            }
        }
    }

    /// Move to `failed`: count the attempt, schedule the retry, drop the slot
    /// and give the installation its traffic back
    async fn fail(
        &self,
        op: &MigrationOperation,
        event: MigrationEvent,
        reason: &str,
        lease: &LeaseGuard,
    ) -> Result<ReconcileOutcome, MigrationError> {
        self.hold(lease)?;
        let now = self.clock.now_millis();
        let mut released = None;
        let outcome = self.transition(op, event, |record| {
            record.attempts = record.attempts.saturating_add(1);
            record.failure_reason = Some(reason.to_string());
            record.next_attempt_at = Some(self.retry_at(now, record.attempts));
            record.copy_job = None;
            released = record.slot.take();
            if !record.destination_pinned {
                record.destination.database_id = None;
            }
        })?;

        if let Some(handle) = released {
            self.allocator.release_slot(&handle);
        }
        if matches!(op.state, MigrationState::Quiescing | MigrationState::Copying) {
            if let Err(err) = self
                .call(lease, "resume", self.lifecycle.resume(&op.installation_id))
                .await
            {
                tracing::warn!(
                    installation = %op.installation_id,
                    error = %err,
                    "resume after failure did not complete; retried before the next attempt"
                );
            }
        }
        Ok(outcome)
    }

    /// Count a failure while already `failed` as an attempt and push the
    /// retry out; the reason that sent the operation here is kept
    fn defer_retry(&self, op: &MigrationOperation) -> Result<ReconcileOutcome, MigrationError> {
        let now = self.clock.now_millis();
        self.store.compare_and_swap(op.id, op.version, &mut |record| {
            record.attempts = record.attempts.saturating_add(1);
            record.next_attempt_at = Some(self.retry_at(now, record.attempts));
            Ok(())
        })?;
        Ok(ReconcileOutcome::Waiting(op.state))
    }

    fn retry_at(&self, now: i64, attempts: u32) -> i64 {
        let delay = i64::try_from(self.config.backoff_ms(attempts)).unwrap_or(i64::MAX);
        now.saturating_add(delay)
    }

    /// Keep the state, record the reason; the next pass retries
    fn note_failure(&self, op: &MigrationOperation, reason: &str) -> Result<ReconcileOutcome, MigrationError> {
        self.store.compare_and_swap(op.id, op.version, &mut |record| {
            record.failure_reason = Some(reason.to_string());
            Ok(())
        })?;
        Ok(ReconcileOutcome::Waiting(op.state))
    }
}

/// Event that moves a failed handler's operation to `failed`, if any
fn failure_event(state: MigrationState, err: &MigrationError) -> Option<MigrationEvent> {
    match (state, err) {
        (MigrationState::Reserving, MigrationError::Allocator(_)) => {
            Some(MigrationEvent::ReservationFailed)
        }
        (MigrationState::Copying, MigrationError::Dependency(DependencyError::CopyFailed { .. })) => {
            Some(MigrationEvent::CopyFailed)
        }
        (
            MigrationState::Requested
            | MigrationState::Reserving
            | MigrationState::Quiescing
            | MigrationState::Copying,
            _,
        ) => Some(MigrationEvent::HandlerFailed),
        _ => None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Treat an `AlreadyReserved` for this very operation as a completed reservation
fn reservation_for(
    op: &MigrationOperation,
    result: Result<dbmig_model::SlotHandle, AllocatorError>,
) -> Result<dbmig_model::SlotHandle, AllocatorError> {
    match result {
        Err(AllocatorError::AlreadyReserved(handle)) if handle.operation_id == Some(op.id) => {
            Ok(handle)
        }
        other => other,
    }
}
