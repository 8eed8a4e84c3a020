//! External collaborators
//!
//! The supervisor never touches installations or data directly. It asks a
//! [`LifecycleController`] to pause, resume and repoint installations and a
//! [`CopyExecutor`] to move the data. Both are async traits so real
//! integrations can sit behind them; the in-memory implementations here back
//! the CLI, the simulator and the tests.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dbmig_model::{
    BackendDescriptor, CopyJobId, DependencyError, Installation, InstallationId,
    InstallationStatus,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Answer to a quiesce request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceStatus {
    /// Traffic is paused
    Ready,
    /// Still draining; ask again later
    Pending,
}

/// State of a copy job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStatus {
    /// Data is on the destination
    Succeeded,
    /// Copy aborted with a reason
    Failed(String),
    /// Still running
    InProgress,
}

/// Installation lifecycle controller
#[async_trait::async_trait]
pub trait LifecycleController: Send + Sync + std::fmt::Debug {
    /// Look up an installation
    async fn installation(&self, id: &InstallationId) -> Result<Installation, DependencyError>;

    /// Pause installation traffic
    async fn quiesce(&self, id: &InstallationId) -> Result<QuiesceStatus, DependencyError>;

    /// Restore installation traffic on its current backend
    async fn resume(&self, id: &InstallationId) -> Result<(), DependencyError>;

    /// Point the installation at `backend`
    async fn repoint(
        &self,
        id: &InstallationId,
        backend: &BackendDescriptor,
    ) -> Result<(), DependencyError>;
}

/// Data copy executor
#[async_trait::async_trait]
pub trait CopyExecutor: Send + Sync + std::fmt::Debug {
    /// Start copying an installation's data as `job`
    ///
    /// Idempotent per job id: starting a job that is already known succeeds
    /// without starting a second copy.
    async fn start_copy(
        &self,
        job: &CopyJobId,
        installation: &InstallationId,
        source: &BackendDescriptor,
        destination: &BackendDescriptor,
    ) -> Result<(), DependencyError>;

    /// Poll a job started by [`CopyExecutor::start_copy`]
    async fn copy_status(&self, job: &CopyJobId) -> Result<CopyStatus, DependencyError>;
}

/// Lifecycle controller over an in-process installation registry
#[derive(Debug, Default)]
pub struct InMemoryLifecycleController {
    installations: DashMap<InstallationId, Installation>,
    pending_polls: DashMap<InstallationId, u32>,
    quiesce_polls: u32,
}

impl InMemoryLifecycleController {
    /// Empty registry; installations quiesce on the first request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `installations`
    #[must_use]
    pub fn with_installations(installations: impl IntoIterator<Item = Installation>) -> Self {
        let controller = Self::new();
        for installation in installations {
            controller.insert(installation);
        }
        controller
    }

    /// Answer `pending` this many times before each quiesce completes
    #[must_use]
    pub fn with_quiesce_polls(mut self, polls: u32) -> Self {
        self.quiesce_polls = polls;
        self
    }

    /// Add or replace an installation
    pub fn insert(&self, installation: Installation) {
        self.installations.insert(installation.id.clone(), installation);
    }

    /// Current record for `id`
    #[must_use]
    pub fn get(&self, id: &InstallationId) -> Option<Installation> {
        self.installations.get(id).map(|i| i.clone())
    }

    /// Every installation, ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<Installation> {
        let mut all: Vec<_> = self.installations.iter().map(|i| i.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn set_status(
        &self,
        id: &InstallationId,
        status: InstallationStatus,
    ) -> Result<(), DependencyError> {
        let mut installation = self
            .installations
            .get_mut(id)
            .ok_or_else(|| DependencyError::InstallationNotFound(id.clone()))?;
        installation.status = status;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LifecycleController for InMemoryLifecycleController {
    async fn installation(&self, id: &InstallationId) -> Result<Installation, DependencyError> {
        self.get(id)
            .ok_or_else(|| DependencyError::InstallationNotFound(id.clone()))
    }

    async fn quiesce(&self, id: &InstallationId) -> Result<QuiesceStatus, DependencyError> {
        let mut installation = self
            .installations
            .get_mut(id)
            .ok_or_else(|| DependencyError::InstallationNotFound(id.clone()))?;
        if installation.status == InstallationStatus::Migrating {
            return Ok(QuiesceStatus::Ready);
        }

        let mut polls = self.pending_polls.entry(id.clone()).or_insert(0);
        if *polls < self.quiesce_polls {
            *polls += 1;
            return Ok(QuiesceStatus::Pending);
        }
        drop(polls);
        self.pending_polls.remove(id);

        installation.status = InstallationStatus::Migrating;
        Ok(QuiesceStatus::Ready)
    }

    async fn resume(&self, id: &InstallationId) -> Result<(), DependencyError> {
        self.pending_polls.remove(id);
        self.set_status(id, InstallationStatus::Stable)
    }

    async fn repoint(
        &self,
        id: &InstallationId,
        backend: &BackendDescriptor,
    ) -> Result<(), DependencyError> {
        let mut installation = self
            .installations
            .get_mut(id)
            .ok_or_else(|| DependencyError::InstallationNotFound(id.clone()))?;
        installation.backend = backend.clone();
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CopyJob {
    installation: InstallationId,
    polls_remaining: u32,
}

/// Copy executor that completes jobs after a fixed number of polls
///
/// A job is forgotten once a poll reports it finished.
#[derive(Debug, Default)]
pub struct InMemoryCopyExecutor {
    jobs: DashMap<CopyJobId, CopyJob>,
    failing: parking_lot::RwLock<HashSet<InstallationId>>,
    polls: u32,
    started: AtomicU64,
}

impl InMemoryCopyExecutor {
    /// Jobs succeed on the first status poll
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `in progress` this many times before finishing
    #[must_use]
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls = polls;
        self
    }

    /// Every copy for `installation` fails from now on
    pub fn fail_installation(&self, installation: impl Into<InstallationId>) {
        self.failing.write().insert(installation.into());
    }

    /// Copies for `installation` succeed again
    pub fn heal_installation(&self, installation: &InstallationId) {
        self.failing.write().remove(installation);
    }

    /// Jobs started so far
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Jobs started and not yet reported finished
    #[must_use]
    pub fn running(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait::async_trait]
impl CopyExecutor for InMemoryCopyExecutor {
    async fn start_copy(
        &self,
        job: &CopyJobId,
        installation: &InstallationId,
        source: &BackendDescriptor,
        destination: &BackendDescriptor,
    ) -> Result<(), DependencyError> {
        let Entry::Vacant(entry) = self.jobs.entry(job.clone()) else {
            tracing::debug!(job = %job, "copy already running");
            return Ok(());
        };
        entry.insert(CopyJob {
            installation: installation.clone(),
            polls_remaining: self.polls,
        });
        self.started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            installation = %installation,
            source = %source,
            destination = %destination,
            job = %job,
            "copy started"
        );
        Ok(())
    }

    async fn copy_status(&self, job: &CopyJobId) -> Result<CopyStatus, DependencyError> {
        let mut entry = self
            .jobs
            .get_mut(job)
            .ok_or_else(|| DependencyError::CopyExecutor(format!("unknown copy job {job}")))?;
        if entry.polls_remaining > 0 {
            entry.polls_remaining -= 1;
            return Ok(CopyStatus::InProgress);
        }
        let failed = self.failing.read().contains(&entry.installation);
        drop(entry);
        self.jobs.remove(job);
        if failed {
            return Ok(CopyStatus::Failed("destination rejected import".into()));
        }
        Ok(CopyStatus::Succeeded)
    }
}
