//! Migration service
//!
//! The operator-facing boundary. Every call maps onto one store or state
//! machine operation and answers with a [`MigrationOperationView`], which
//! never carries lease or version details.
//!
//! Commit and rollback go through [`state_machine::apply`] before touching
//! the store, so a redelivered decision is a no-op and a decision in the
//! wrong state is rejected without mutation.

use dbmig_kernel::allocator::{CapacityAllocator, SlotRequirement};
use dbmig_kernel::clock::Clock;
use dbmig_kernel::collaborators::LifecycleController;
use dbmig_kernel::state_machine::{self, MigrationEvent};
use dbmig_kernel::store::OperationStore;
use dbmig_model::{
    BackendDescriptor, DependencyError, MigrationError, MigrationOperation,
    MigrationOperationView, MigrationRequest, OperationFilter, OperationId,
};
use std::sync::Arc;

/// Operator API over the operation store
#[derive(Debug, Clone)]
pub struct MigrationService {
    store: Arc<dyn OperationStore>,
    allocator: Arc<CapacityAllocator>,
    lifecycle: Arc<dyn LifecycleController>,
    clock: Arc<dyn Clock>,
}

impl MigrationService {
    /// Create a service over shared state
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        allocator: Arc<CapacityAllocator>,
        lifecycle: Arc<dyn LifecycleController>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            allocator,
            lifecycle,
            clock,
        }
    }

    /// Create a migration operation in `requested`
    ///
    /// # Errors
    /// - `MigrationError::InvalidRequest` if the installation is unknown, the
    ///   destination kind is not multi-tenant, or the destination is the
    ///   installation's current backend
    /// - `AllocatorError::DatabaseNotFound` for an unknown pinned instance
    /// - `AllocatorError::IncompatibleBackend` if the pinned instance serves
    ///   another kind or version
    /// - `AllocatorError::CapacityExhausted` if the pinned instance is full
    /// - `StoreError::ConflictingOperation` if the installation already has an
    ///   active operation
    pub async fn request_migration(
        &self,
        request: MigrationRequest,
    ) -> Result<MigrationOperationView, MigrationError> {
        let kind = request.destination_database;
        if !kind.is_multi_tenant() {
            return Err(MigrationError::InvalidRequest(format!(
                "destination kind {kind} is not a multi-tenant kind"
            )));
        }

        let installation = match self.lifecycle.installation(&request.installation_id).await {
            Ok(installation) => installation,
            Err(DependencyError::InstallationNotFound(id)) => {
                return Err(MigrationError::InvalidRequest(format!(
                    "installation {id} does not exist"
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let destination = BackendDescriptor {
            kind,
            database_id: request.pinned_database().cloned(),
        };
        if destination == installation.backend {
            return Err(MigrationError::InvalidRequest(format!(
                "installation {} already uses {destination}",
                installation.id
            )));
        }
        if let Some(database) = &destination.database_id {
            let requirement = SlotRequirement::new(kind, installation.database_version.clone());
            self.allocator.admit(database, &requirement)?;
        }

        let op = MigrationOperation::new(
            installation.id,
            installation.backend,
            destination,
            self.clock.now_millis(),
        );
        let id = self.store.create(op)?;
        let created = self.store.get(id)?;

        tracing::info!(
            operation = %id,
            installation = %created.installation_id,
            destination = %created.destination,
            "migration requested"
        );
        Ok(created.view())
    }

    /// One operation
    ///
    /// # Errors
    /// - `StoreError::NotFound` for an unknown id
    pub fn get_operation(&self, id: OperationId) -> Result<MigrationOperationView, MigrationError> {
        Ok(self.store.get(id)?.view())
    }

    /// Operations matching `filter`, newest first
    #[must_use]
    pub fn list_operations(&self, filter: &OperationFilter) -> Vec<MigrationOperationView> {
        self.store
            .list(filter)
            .iter()
            .map(MigrationOperation::view)
            .collect()
    }

    /// Accept a `migrated` operation
    ///
    /// # Errors
    /// - `TransitionError::InvalidStateForCommit` outside `migrated`
    /// - `StoreError::VersionConflict` if the operation moved concurrently
    pub fn commit_operation(&self, id: OperationId) -> Result<MigrationOperationView, MigrationError> {
        self.decide(id, MigrationEvent::CommitRequested)
    }

    /// Reject a `migrated` operation
    ///
    /// # Errors
    /// - `TransitionError::InvalidStateForCancel` outside `migrated`
    /// - `StoreError::VersionConflict` if the operation moved concurrently
    pub fn rollback_operation(
        &self,
        id: OperationId,
    ) -> Result<MigrationOperationView, MigrationError> {
        self.decide(id, MigrationEvent::RollbackRequested)
    }

    fn decide(
        &self,
        id: OperationId,
        event: MigrationEvent,
    ) -> Result<MigrationOperationView, MigrationError> {
        let op = self.store.get(id)?;
        if !state_machine::apply(op.state, event)?.is_applied() {
            tracing::debug!(operation = %id, %event, state = %op.state, "decision already applied");
            return Ok(op.view());
        }

        let updated = self.store.compare_and_swap(id, op.version, &mut |record| {
            record.state = state_machine::apply(record.state, event)?.state();
            Ok(())
        })?;

        tracing::info!(operation = %id, %event, state = %updated.state, "operator decision recorded");
        Ok(updated.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbmig_kernel::clock::ManualClock;
    use dbmig_kernel::collaborators::InMemoryLifecycleController;
    use dbmig_kernel::store::InMemoryOperationStore;
    use dbmig_model::{DatabaseKind, Installation, MigrationState, MultiTenantDatabase};

    fn service() -> (MigrationService, Arc<InMemoryOperationStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryOperationStore::new(Arc::clone(&clock)));
        let allocator = Arc::new(CapacityAllocator::from_databases([MultiTenantDatabase::new(
            "db-1",
            DatabaseKind::MultiTenantRdsPostgres,
            2,
            "pg-14",
        )]));
        let lifecycle = Arc::new(InMemoryLifecycleController::with_installations([
            Installation::new(
                "i1",
                BackendDescriptor::dedicated(DatabaseKind::SingleTenantRdsPostgres),
                "pg-14",
            ),
        ]));
        let service = MigrationService::new(
            Arc::clone(&store) as Arc<dyn OperationStore>,
            allocator,
            lifecycle,
            clock,
        );
        (service, store)
    }

    #[tokio::test]
    async fn request_records_source_and_pinned_destination() {
        let (service, store) = service();
        let view = service
            .request_migration(MigrationRequest::new(
                "i1",
                DatabaseKind::MultiTenantRdsPostgres,
                Some("db-1".into()),
            ))
            .await
            .unwrap();

        assert_eq!(view.state, MigrationState::Requested);
        assert_eq!(view.request_at, 1_000);
        let op = store.get(view.id).unwrap();
        assert!(op.destination_pinned);
        assert_eq!(op.source.kind, DatabaseKind::SingleTenantRdsPostgres);
    }

    #[tokio::test]
    async fn decisions_outside_migrated_are_rejected() {
        let (service, _) = service();
        let view = service
            .request_migration(MigrationRequest::new(
                "i1",
                DatabaseKind::MultiTenantRdsPostgres,
                None,
            ))
            .await
            .unwrap();

        let err = service.commit_operation(view.id).unwrap_err();
        assert_eq!(
            err,
            dbmig_model::TransitionError::InvalidStateForCommit(MigrationState::Requested).into()
        );
        assert_eq!(service.get_operation(view.id).unwrap(), view);
    }
}
