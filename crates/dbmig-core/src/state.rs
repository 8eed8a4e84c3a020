//! Local state file
//!
//! The CLI and `serve` share one JSON document holding the installation
//! registry, the allocator's occupancy rows and every operation record.
//! Writes go to a sibling temp file first and are renamed into place.
//!
//! Every read-modify-write holds an exclusive advisory lock on a sibling
//! `.lock` file. A one-shot CLI command loads, mutates and saves under the
//! lock. `serve` keeps its state in memory and calls [`LocalState::sync`],
//! which reloads the file and keeps the higher version of each operation, so
//! a decision made from the CLI is not overwritten by the next save.

use crate::service::MigrationService;
use dbmig_kernel::allocator::{CapacityAllocator, SlotRequirement};
use dbmig_kernel::clock::Clock;
use dbmig_kernel::collaborators::{CopyExecutor, InMemoryLifecycleController, LifecycleController};
use dbmig_kernel::config::SupervisorConfig;
use dbmig_kernel::store::{InMemoryOperationStore, OperationStore};
use dbmig_kernel::supervisor::Supervisor;
use dbmig_model::{
    AllocatorError, Installation, MigrationError, MigrationOperation, MultiTenantDatabase,
    StoreError,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persisted control-plane state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Installation registry
    #[serde(default)]
    pub installations: Vec<Installation>,
    /// Shared instances with their occupied slots
    #[serde(default)]
    pub databases: Vec<MultiTenantDatabase>,
    /// Every operation, terminal ones included
    #[serde(default)]
    pub operations: Vec<MigrationOperation>,
    /// When the snapshot was taken (unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<i64>,
}

impl StateSnapshot {
    /// Read a snapshot; a missing file is an empty state
    ///
    /// # Errors
    /// - `StoreError::Persistence` if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StoreError::Persistence(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StoreError::Persistence(format!("{}: {e}", path.display()))),
        }
    }

    /// Write the snapshot atomically
    ///
    /// # Errors
    /// - `StoreError::Persistence` on serialization or I/O failure
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| StoreError::Persistence(format!("{}: {e}", path.display())))
    }
}

/// Exclusive advisory lock beside a state file, released on drop
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Block until the lock for `state_file` is ours
    ///
    /// # Errors
    /// - `StoreError::Persistence` if the lock file cannot be opened or locked
    pub fn acquire(state_file: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = state_file.as_ref().with_extension("lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Persistence(format!("{}: {e}", path.display())))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| StoreError::Persistence(format!("locking {}: {e}", path.display())))?;
        tracing::debug!(lock = %path.display(), "acquired state lock");
        Ok(Self { file, path })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(lock = %self.path.display(), error = %err, "unlock failed");
        }
    }
}

/// What [`LocalState::sync`] took from the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Operations that were new or newer on disk
    pub operations: usize,
    /// Instances registered by another process
    pub databases: usize,
    /// Installations registered by another process
    pub installations: usize,
}

impl MergeReport {
    /// Nothing was taken
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// In-process state rebuilt from a [`StateSnapshot`]
#[derive(Debug, Clone)]
pub struct LocalState {
    clock: Arc<dyn Clock>,
    store: Arc<InMemoryOperationStore>,
    allocator: Arc<CapacityAllocator>,
    lifecycle: Arc<InMemoryLifecycleController>,
}

impl LocalState {
    /// Empty state
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(InMemoryOperationStore::new(Arc::clone(&clock))),
            allocator: Arc::new(CapacityAllocator::new()),
            lifecycle: Arc::new(InMemoryLifecycleController::new()),
            clock,
        }
    }

    /// Rebuild from a snapshot
    ///
    /// # Errors
    /// - `StoreError::Persistence` if an instance is over capacity or an
    ///   installation has two active operations
    pub fn restore(snapshot: StateSnapshot, clock: Arc<dyn Clock>) -> Result<Self, MigrationError> {
        if let Some(db) = snapshot.databases.iter().find(|db| db.occupied() > db.capacity) {
            return Err(StoreError::Persistence(format!(
                "database {} holds {} slots but has capacity {}",
                db.id,
                db.occupied(),
                db.capacity
            ))
            .into());
        }

        let store = InMemoryOperationStore::from_operations(snapshot.operations, Arc::clone(&clock))?;
        Ok(Self {
            store: Arc::new(store),
            allocator: Arc::new(CapacityAllocator::from_databases(snapshot.databases)),
            lifecycle: Arc::new(InMemoryLifecycleController::with_installations(
                snapshot.installations,
            )),
            clock,
        })
    }

    /// Load `path` and rebuild
    ///
    /// # Errors
    /// See [`StateSnapshot::load`] and [`LocalState::restore`].
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, MigrationError> {
        Self::restore(StateSnapshot::load(path)?, clock)
    }

    /// Capture the current state
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            installations: self.lifecycle.snapshot(),
            databases: self.allocator.snapshot(),
            operations: self.store.snapshot(),
            saved_at: Some(self.clock.now_millis()),
        }
    }

    /// Capture and write to `path`
    ///
    /// Callers sharing the file with other processes hold a [`StateLock`].
    ///
    /// # Errors
    /// - `StoreError::Persistence` on I/O failure
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        self.snapshot().save(path)
    }

    /// Merge what other processes wrote to `path` and write the result back
    ///
    /// Holds the [`StateLock`] throughout. Operations keep the higher version;
    /// databases and installations unknown here are added, known ones keep
    /// their in-memory rows.
    ///
    /// # Errors
    /// - `StoreError::Persistence` on lock, read, parse or write failure
    pub fn sync(&self, path: impl AsRef<Path>) -> Result<MergeReport, StoreError> {
        let path = path.as_ref();
        let _lock = StateLock::acquire(path)?;
        let report = self.merge(StateSnapshot::load(path)?);
        if !report.is_empty() {
            tracing::info!(
                operations = report.operations,
                databases = report.databases,
                installations = report.installations,
                "picked up changes from state file"
            );
        }
        self.save(path)?;
        Ok(report)
    }

    /// Fold a snapshot written elsewhere into this state
    pub fn merge(&self, snapshot: StateSnapshot) -> MergeReport {
        let mut report = MergeReport::default();

        for database in snapshot.databases {
            if self.allocator.free_slots(&database.id).is_err()
                && self.allocator.register_database(database).is_ok()
            {
                report.databases += 1;
            }
        }

        for installation in snapshot.installations {
            if self.lifecycle.get(&installation.id).is_some() {
                continue;
            }
            if let Some(database) = installation.backend.slot_database() {
                if self.allocator.holder(&installation.id, database).is_none() {
                    let requirement = SlotRequirement::new(
                        installation.backend.kind,
                        installation.database_version.clone(),
                    );
                    if let Err(err) =
                        self.allocator
                            .reserve(&installation.id, database, &requirement, None)
                    {
                        tracing::warn!(
                            installation = %installation.id,
                            database = %database,
                            error = %err,
                            "could not take slot for installation registered elsewhere"
                        );
                    }
                }
            }
            self.lifecycle.insert(installation);
            report.installations += 1;
        }

        for op in snapshot.operations {
            if self.store.absorb(op) {
                report.operations += 1;
            }
        }
        report
    }

    /// Add a shared instance
    ///
    /// # Errors
    /// - `AllocatorError::DatabaseExists` if the id is taken
    pub fn register_database(&self, database: MultiTenantDatabase) -> Result<(), AllocatorError> {
        self.allocator.register_database(database)
    }

    /// Add an installation; one already living on a shared instance takes its slot there
    ///
    /// # Errors
    /// - `MigrationError::InvalidRequest` if the id is taken
    /// - any `AllocatorError` from reserving the existing slot
    pub fn register_installation(&self, installation: Installation) -> Result<(), MigrationError> {
        if self.lifecycle.get(&installation.id).is_some() {
            return Err(MigrationError::InvalidRequest(format!(
                "installation {} already exists",
                installation.id
            )));
        }
        if let Some(database) = installation.backend.slot_database() {
            let requirement = SlotRequirement::new(
                installation.backend.kind,
                installation.database_version.clone(),
            );
            self.allocator
                .reserve(&installation.id, database, &requirement, None)?;
        }
        tracing::info!(
            installation = %installation.id,
            backend = %installation.backend,
            "registered installation"
        );
        self.lifecycle.insert(installation);
        Ok(())
    }

    /// Operator API over this state
    #[must_use]
    pub fn service(&self) -> MigrationService {
        MigrationService::new(
            Arc::clone(&self.store) as Arc<dyn OperationStore>,
            Arc::clone(&self.allocator),
            Arc::clone(&self.lifecycle) as Arc<dyn LifecycleController>,
            Arc::clone(&self.clock),
        )
    }

    /// Supervisor over this state with the given copy executor
    #[must_use]
    pub fn supervisor(&self, copier: Arc<dyn CopyExecutor>, config: SupervisorConfig) -> Supervisor {
        Supervisor::new(
            Arc::clone(&self.store) as Arc<dyn OperationStore>,
            Arc::clone(&self.allocator),
            Arc::clone(&self.lifecycle) as Arc<dyn LifecycleController>,
            copier,
            Arc::clone(&self.clock),
            config,
        )
    }

    /// Operation store
    #[must_use]
    pub fn store(&self) -> &Arc<InMemoryOperationStore> {
        &self.store
    }

    /// Capacity allocator
    #[must_use]
    pub fn allocator(&self) -> &Arc<CapacityAllocator> {
        &self.allocator
    }

    /// Installation registry
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<InMemoryLifecycleController> {
        &self.lifecycle
    }
}
