//! Per-state handlers
//!
//! Each handler performs the external work its state needs and then records
//! the outcome with a single compare-and-swap. Handlers return errors rather
//! than deciding how to fail; [`Supervisor::reconcile`] does that. External
//! work must be safe to repeat: a pass can stop between a call and its
//! compare-and-swap, and the next pass makes the same call again.

use super::{reservation_for, ReconcileOutcome, Supervisor};
use crate::lease::LeaseGuard;
use crate::allocator::SlotRequirement;
use crate::collaborators::{CopyStatus, QuiesceStatus};
use crate::state_machine::MigrationEvent;
use dbmig_model::{CopyJobId, DependencyError, MigrationError, MigrationOperation, MigrationState};

type HandlerResult = Result<ReconcileOutcome, MigrationError>;

impl Supervisor {
    pub(super) async fn handle(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        match op.state {
            MigrationState::Requested => self.begin(op, lease).await,
            MigrationState::Reserving => self.reserve(op, lease).await,
            MigrationState::Quiescing => self.quiesce(op, lease).await,
            MigrationState::Copying => self.poll_copy(op, lease).await,
            MigrationState::Committing => self.finalize(op, lease).await,
            MigrationState::RollingBack => self.restore(op, lease).await,
            MigrationState::Failed => self.retry_or_abandon(op, lease).await,
            // awaiting an operator decision, or already done
            MigrationState::Migrated
            | MigrationState::Committed
            | MigrationState::RolledBack
            | MigrationState::Abandoned => Ok(ReconcileOutcome::Waiting(op.state)),
        }
    }

    /// `requested`: the installation must still be reachable
    async fn begin(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        self.call(lease, "installation", self.lifecycle.installation(&op.installation_id))
            .await?;
        self.transition(op, MigrationEvent::Begin, |record| {
            record.next_attempt_at = None;
        })
    }

    /// `reserving`: pick the destination (unless pinned) and take a slot on it
    async fn reserve(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        let installation = self
            .call(lease, "installation", self.lifecycle.installation(&op.installation_id))
            .await?;
        let requirement =
            SlotRequirement::new(op.destination.kind, installation.database_version.clone());

        let database = match &op.destination.database_id {
            Some(id) => id.clone(),
            None => self.allocator.select_avoiding(
                &requirement,
                true,
                op.source.slot_database(),
            )?,
        };
        let handle = reservation_for(
            op,
            self.allocator
                .reserve(&op.installation_id, &database, &requirement, Some(op.id)),
        )?;

        let result = self.transition(op, MigrationEvent::SlotReserved, |record| {
            record.destination.database_id = Some(database.clone());
            record.slot = Some(handle.clone());
        });
        if result.is_err() {
            self.allocator.release_slot(&handle);
        }
        result
    }

    /// `quiescing`: wait for the installation to pause, then start the copy
    ///
    /// The job id is fixed per attempt, so a pass that starts the copy and then
    /// loses its compare-and-swap leaves a job the next pass re-attaches to.
    async fn quiesce(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        let status = self
            .call(lease, "quiesce", self.lifecycle.quiesce(&op.installation_id))
            .await?;
        if status == QuiesceStatus::Pending {
            return self.keep_waiting(op, "quiesce", self.config.quiesce_timeout_ms);
        }

        let job = CopyJobId::for_attempt(op.id, op.attempts);
        self.call(
            lease,
            "start_copy",
            self.copier
                .start_copy(&job, &op.installation_id, &op.source, &op.destination),
        )
        .await?;
        self.transition(op, MigrationEvent::InstallationPaused, |record| {
            record.copy_job = Some(job.clone());
        })
    }

    /// `copying`: poll the copy job
    async fn poll_copy(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        let job = op.copy_job.clone().ok_or_else(|| {
            DependencyError::CopyExecutor(format!("operation {} has no copy job", op.id))
        })?;

        match self.call(lease, "copy_status", self.copier.copy_status(&job)).await? {
            CopyStatus::Succeeded => self.transition(op, MigrationEvent::CopySucceeded, |_| {}),
            CopyStatus::InProgress => self.keep_waiting(op, "copy", self.config.copy_timeout_ms),
            CopyStatus::Failed(reason) => Err(DependencyError::CopyFailed { job, reason }.into()),
        }
    }

    /// `committing`: repoint to the destination and free the source slot
    async fn finalize(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        self.call(
            lease,
            "repoint",
            self.lifecycle.repoint(&op.installation_id, &op.destination),
        )
        .await?;
        self.call(lease, "resume", self.lifecycle.resume(&op.installation_id))
            .await?;
        if let Some(source_db) = op.source.slot_database() {
            self.allocator.release(&op.installation_id, source_db);
        }
        self.transition(op, MigrationEvent::FinalizeSucceeded, |record| {
            record.failure_reason = None;
        })
    }

    /// `rolling-back`: repoint to the source and free the destination slot
    async fn restore(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        self.call(lease, "repoint", self.lifecycle.repoint(&op.installation_id, &op.source))
            .await?;
        self.call(lease, "resume", self.lifecycle.resume(&op.installation_id))
            .await?;
        if let Some(handle) = &op.slot {
            self.allocator.release_slot(handle);
        }
        self.transition(op, MigrationEvent::RestoreSucceeded, |record| {
            record.slot = None;
            record.failure_reason = None;
        })
    }

    /// `failed`: abandon at the attempt ceiling, otherwise retry once the backoff elapsed
    async fn retry_or_abandon(&self, op: &MigrationOperation, lease: &LeaseGuard) -> HandlerResult {
        if op.attempts >= self.config.max_attempts {
            // the operation ends here whether or not the installation answers
            if let Err(err) = self
                .call(lease, "resume", self.lifecycle.resume(&op.installation_id))
                .await
            {
                if matches!(err, MigrationError::Lease(_)) {
                    return Err(err);
                }
                tracing::warn!(
                    operation = %op.id,
                    installation = %op.installation_id,
                    error = %err,
                    "resume before abandoning failed"
                );
            }
            tracing::warn!(
                operation = %op.id,
                installation = %op.installation_id,
                attempts = op.attempts,
                reason = op.failure_reason.as_deref().unwrap_or(""),
                "retries exhausted, abandoning"
            );
            return self.transition(op, MigrationEvent::RetriesExhausted, |_| {});
        }

        let now = self.clock.now_millis();
        if op.next_attempt_at.is_some_and(|at| at > now) {
            return Ok(ReconcileOutcome::Waiting(op.state));
        }

        self.call(lease, "resume", self.lifecycle.resume(&op.installation_id))
            .await?;
        self.transition(op, MigrationEvent::Retry, |record| {
            record.next_attempt_at = None;
        })
    }

    /// Stay put unless the state has outlived `limit_ms`
    fn keep_waiting(&self, op: &MigrationOperation, call: &'static str, limit_ms: u64) -> HandlerResult {
        let waited = self.clock.now_millis().saturating_sub(op.last_transition_at);
        if u64::try_from(waited).unwrap_or(0) >= limit_ms {
            return Err(DependencyError::Timeout {
                call,
                duration_ms: limit_ms,
            }
            .into());
        }
        Ok(ReconcileOutcome::Waiting(op.state))
    }
}
