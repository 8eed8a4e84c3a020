//! Testing utilities for the dbmig workspace
//!
//! Scripted collaborators, fault injection and a supervisor fixture.

#![allow(missing_docs)]

use dbmig_kernel::prelude::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub const VERSION_TAG: &str = "pg-14";
pub const SHARED_KIND: DatabaseKind = DatabaseKind::MultiTenantRdsPostgres;
pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Lifecycle call names used for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleCall {
    Installation,
    Quiesce,
    Resume,
    Repoint,
}

/// What a faulted call does
#[derive(Debug, Clone)]
pub enum Fault {
    /// Return this error
    Error(DependencyError),
    /// Never answer
    Hang,
    /// Panic inside the call
    Panic(&'static str),
    /// Answer after a delay
    Delay(Duration),
    /// Move the fixture clock forward, then answer
    AdvanceClock(i64),
}

/// In-memory lifecycle controller with injectable faults and call counters
#[derive(Debug, Default)]
pub struct FaultyLifecycle {
    inner: InMemoryLifecycleController,
    faults: Mutex<HashMap<LifecycleCall, Fault>>,
    calls: Mutex<HashMap<LifecycleCall, usize>>,
    clock: Option<ManualClock>,
}

impl FaultyLifecycle {
    pub fn new(inner: InMemoryLifecycleController) -> Self {
        Self {
            inner,
            faults: Mutex::default(),
            calls: Mutex::default(),
            clock: None,
        }
    }

    /// Clock moved by [`Fault::AdvanceClock`]
    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn inner(&self) -> &InMemoryLifecycleController {
        &self.inner
    }

    pub fn set_fault(&self, call: LifecycleCall, fault: Fault) {
        self.faults.lock().insert(call, fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn calls(&self, call: LifecycleCall) -> usize {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    async fn enter(&self, call: LifecycleCall) -> Result<(), DependencyError> {
        *self.calls.lock().entry(call).or_default() += 1;
        let fault = self.faults.lock().get(&call).cloned();
        match fault {
            None => Ok(()),
            Some(Fault::Error(err)) => Err(err),
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Panic(message)) => panic!("{message}"),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::AdvanceClock(millis)) => {
                if let Some(clock) = &self.clock {
                    clock.advance_millis(millis);
                }
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl LifecycleController for FaultyLifecycle {
    async fn installation(&self, id: &InstallationId) -> Result<Installation, DependencyError> {
        self.enter(LifecycleCall::Installation).await?;
        self.inner.installation(id).await
    }

    async fn quiesce(&self, id: &InstallationId) -> Result<QuiesceStatus, DependencyError> {
        self.enter(LifecycleCall::Quiesce).await?;
        self.inner.quiesce(id).await
    }

    async fn resume(&self, id: &InstallationId) -> Result<(), DependencyError> {
        self.enter(LifecycleCall::Resume).await?;
        self.inner.resume(id).await
    }

    async fn repoint(
        &self,
        id: &InstallationId,
        backend: &BackendDescriptor,
    ) -> Result<(), DependencyError> {
        self.enter(LifecycleCall::Repoint).await?;
        self.inner.repoint(id, backend).await
    }
}

/// Callback run once after the next copy starts
#[derive(Clone)]
pub struct StartHook(Arc<dyn Fn() + Send + Sync>);

impl std::fmt::Debug for StartHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StartHook")
    }
}

/// Copy executor answering status polls from a script
///
/// Each poll pops the next scripted status; an empty script answers
/// `Succeeded`. Starting a job id twice records it once.
#[derive(Debug, Default)]
pub struct ScriptedCopyExecutor {
    script: Mutex<VecDeque<CopyStatus>>,
    started: Mutex<Vec<(InstallationId, CopyJobId)>>,
    after_start: Mutex<Option<StartHook>>,
}

impl ScriptedCopyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, status: CopyStatus) {
        self.script.lock().push_back(status);
    }

    pub fn push_failures(&self, count: usize, reason: &str) {
        let mut script = self.script.lock();
        for n in 1..=count {
            script.push_back(CopyStatus::Failed(format!("{reason} #{n}")));
        }
    }

    /// Run `hook` once, right after the next `start_copy` returns its answer
    pub fn after_next_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.after_start.lock() = Some(StartHook(Arc::new(hook)));
    }

    /// Distinct jobs started
    pub fn started(&self) -> usize {
        self.started.lock().len()
    }

    pub fn jobs(&self) -> Vec<CopyJobId> {
        self.started.lock().iter().map(|(_, job)| job.clone()).collect()
    }
}

#[async_trait::async_trait]
impl CopyExecutor for ScriptedCopyExecutor {
    async fn start_copy(
        &self,
        job: &CopyJobId,
        installation: &InstallationId,
        _source: &BackendDescriptor,
        _destination: &BackendDescriptor,
    ) -> Result<(), DependencyError> {
        {
            let mut started = self.started.lock();
            if !started.iter().any(|(_, known)| known == job) {
                started.push((installation.clone(), job.clone()));
            }
        }
        let hook = self.after_start.lock().take();
        if let Some(StartHook(hook)) = hook {
            hook();
        }
        Ok(())
    }

    async fn copy_status(&self, _job: &CopyJobId) -> Result<CopyStatus, DependencyError> {
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or(CopyStatus::Succeeded))
    }
}

/// Supervisor config with short deadlines for tests
pub fn test_config() -> SupervisorConfig {
    SupervisorConfig::new()
        .with_lease_ttl_ms(5_000)
        .with_call_timeout_ms(200)
        .with_backoff_ms(100, 400)
        .with_wait_timeouts_ms(10_000, 10_000)
        .with_max_attempts(3)
        .with_workers(2)
}

pub fn dedicated_installation(id: &str) -> Installation {
    Installation::new(
        id,
        BackendDescriptor::dedicated(DatabaseKind::SingleTenantRdsPostgres),
        VERSION_TAG,
    )
}

/// Builder for [`Fixture`]
#[derive(Debug)]
pub struct FixtureBuilder {
    databases: Vec<MultiTenantDatabase>,
    installations: Vec<Installation>,
    config: SupervisorConfig,
    quiesce_polls: u32,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            installations: Vec::new(),
            config: test_config(),
            quiesce_polls: 0,
        }
    }
}

impl FixtureBuilder {
    pub fn database(mut self, id: &str, capacity: u32) -> Self {
        self.databases
            .push(MultiTenantDatabase::new(id, SHARED_KIND, capacity, VERSION_TAG));
        self
    }

    pub fn installation(mut self, id: &str) -> Self {
        self.installations.push(dedicated_installation(id));
        self
    }

    pub fn installation_record(mut self, installation: Installation) -> Self {
        self.installations.push(installation);
        self
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn quiesce_polls(mut self, polls: u32) -> Self {
        self.quiesce_polls = polls;
        self
    }

    pub fn build(self) -> Fixture {
        let clock = ManualClock::new(START_MILLIS);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryOperationStore::new(Arc::clone(&shared_clock)));
        let allocator = Arc::new(CapacityAllocator::from_databases(self.databases));
        let lifecycle = Arc::new(
            FaultyLifecycle::new(
                InMemoryLifecycleController::with_installations(self.installations)
                    .with_quiesce_polls(self.quiesce_polls),
            )
            .with_clock(clock.clone()),
        );
        let copier = Arc::new(ScriptedCopyExecutor::new());
        let leases = Arc::new(LeaseTable::new(Arc::clone(&shared_clock)));
        let supervisor = Arc::new(
            Supervisor::new(
                Arc::clone(&store) as Arc<dyn OperationStore>,
                Arc::clone(&allocator),
                Arc::clone(&lifecycle) as Arc<dyn LifecycleController>,
                Arc::clone(&copier) as Arc<dyn CopyExecutor>,
                Arc::clone(&shared_clock),
                self.config,
            )
            .with_leases(Arc::clone(&leases)),
        );

        Fixture {
            clock,
            shared_clock,
            store,
            allocator,
            lifecycle,
            copier,
            leases,
            supervisor,
            worker: WorkerId::new("worker-test"),
        }
    }
}

/// A wired-up supervisor over in-memory state
#[derive(Debug)]
pub struct Fixture {
    pub clock: ManualClock,
    pub shared_clock: Arc<dyn Clock>,
    pub store: Arc<InMemoryOperationStore>,
    pub allocator: Arc<CapacityAllocator>,
    pub lifecycle: Arc<FaultyLifecycle>,
    pub copier: Arc<ScriptedCopyExecutor>,
    pub leases: Arc<LeaseTable>,
    pub supervisor: Arc<Supervisor>,
    pub worker: WorkerId,
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::default()
    }

    /// One shared instance `db-1` of `capacity` and installations `i1..=iN`
    pub fn standard(capacity: u32, installations: usize) -> Self {
        let mut builder = Self::builder().database("db-1", capacity);
        for n in 1..=installations {
            builder = builder.installation(&format!("i{n}"));
        }
        builder.build()
    }

    /// Another supervisor sharing this fixture's store, allocator and leases
    pub fn second_supervisor(&self) -> Supervisor {
        Supervisor::new(
            Arc::clone(&self.store) as Arc<dyn OperationStore>,
            Arc::clone(&self.allocator),
            Arc::clone(&self.lifecycle) as Arc<dyn LifecycleController>,
            Arc::clone(&self.copier) as Arc<dyn CopyExecutor>,
            Arc::clone(&self.shared_clock),
            self.supervisor.config().clone(),
        )
        .with_leases(Arc::clone(&self.leases))
    }

    /// Create an operation for `installation` straight in the store
    pub fn request(&self, installation: &str, database: Option<&str>) -> OperationId {
        let id = InstallationId::new(installation);
        let source = self
            .lifecycle
            .inner()
            .get(&id)
            .map(|i| i.backend)
            .unwrap_or_else(|| BackendDescriptor::dedicated(DatabaseKind::SingleTenantRdsPostgres));
        let destination = match database {
            Some(db) => BackendDescriptor::multi_tenant(SHARED_KIND, db),
            None => BackendDescriptor::dedicated(SHARED_KIND),
        };
        let op = MigrationOperation::new(id, source, destination, self.clock.now_millis());
        self.store.create(op).unwrap()
    }

    pub fn op(&self, id: OperationId) -> MigrationOperation {
        self.store.get(id).unwrap()
    }

    pub async fn pass(&self) -> ReconcileReport {
        self.supervisor.run_once(&self.worker).await
    }

    /// Reconcile until `id` reaches `state`, stepping the clock past any backoff
    pub async fn drive_until(&self, id: OperationId, state: MigrationState) -> MigrationOperation {
        for _ in 0..50 {
            let op = self.op(id);
            if op.state == state {
                return op;
            }
            if op.state.is_terminal() {
                panic!("operation reached {} while waiting for {state}", op.state);
            }
            let listed = op.clone();
            self.supervisor.reconcile(&self.worker, &listed).await;
            self.clock
                .advance_millis(i64::try_from(self.supervisor.config().backoff_cap_ms).unwrap());
        }
        panic!("operation never reached {state}: {:?}", self.op(id));
    }

    /// Operator decision applied through the state machine
    pub fn decide(&self, id: OperationId, event: MigrationEvent) -> Result<MigrationOperation, MigrationError> {
        let op = self.op(id);
        if !dbmig_kernel::state_machine::apply(op.state, event)?.is_applied() {
            return Ok(op);
        }
        self.store.compare_and_swap(id, op.version, &mut |record| {
            record.state = dbmig_kernel::state_machine::apply(record.state, event)?.state();
            Ok(())
        })
    }

    pub fn installation(&self, id: &str) -> Installation {
        self.lifecycle.inner().get(&InstallationId::new(id)).unwrap()
    }
}
