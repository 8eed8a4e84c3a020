//! Migration simulator
//!
//! Seeded randomized run of the whole control plane: installations request
//! migrations onto a handful of small shared instances, several supervisors
//! reconcile concurrently against one lease table, copies fail at random and
//! an operator commits or rolls back whatever reaches `migrated`.
//!
//! Checked after every round:
//! - no instance holds more slots than its capacity
//! - at most one active operation per installation
//! - every slot tagged with an operation belongs to a live or committed one
//!
//! After the last round failures are healed and everything is driven to a
//! terminal state; anything still active is reported as stuck.

use crate::allocator::CapacityAllocator;
use crate::clock::{Clock, ManualClock};
use crate::collaborators::{
    CopyExecutor, InMemoryCopyExecutor, InMemoryLifecycleController, LifecycleController,
};
use crate::config::SupervisorConfig;
use crate::lease::LeaseTable;
use crate::state_machine::{self, MigrationEvent};
use crate::store::{InMemoryOperationStore, OperationStore};
use crate::supervisor::Supervisor;
use dbmig_model::{
    BackendDescriptor, DatabaseId, DatabaseKind, Installation, InstallationId, MigrationOperation,
    MigrationState, MultiTenantDatabase, OperationId, StoreError, WorkerId,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

const KIND: DatabaseKind = DatabaseKind::MultiTenantRdsPostgres;
const VERSION: &str = "pg-14";

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Installations competing for capacity
    pub installations: usize,
    /// Shared instances
    pub databases: usize,
    /// Slots per instance
    pub capacity: u32,
    /// Request/reconcile/decide rounds
    pub rounds: usize,
    /// Concurrent supervisors
    pub workers: usize,
    /// Chance per round that an installation's copies start failing
    pub copy_failure_rate: f64,
    /// Chance per round that a new request is issued per installation
    pub request_rate: f64,
    /// Chance that a decided migration is committed rather than rolled back
    pub commit_rate: f64,
    /// Attempt ceiling
    pub max_attempts: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            installations: 12,
            databases: 3,
            capacity: 3,
            rounds: 60,
            workers: 3,
            copy_failure_rate: 0.1,
            request_rate: 0.2,
            commit_rate: 0.7,
            max_attempts: 3,
        }
    }
}

/// An invariant broken during simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Instance over capacity
    CapacityExceeded {
        /// Instance
        database: DatabaseId,
        /// Slots held
        occupied: u32,
        /// Capacity
        capacity: u32,
    },
    /// More than one active operation for one installation
    MultipleActive {
        /// Installation
        installation: InstallationId,
        /// Active operations found
        count: usize,
    },
    /// Slot held for an operation that no longer needs it
    OrphanSlot {
        /// Instance
        database: DatabaseId,
        /// Slot owner
        installation: InstallationId,
        /// Operation named on the slot
        operation: OperationId,
    },
    /// Operation still active after the drain phase
    Stuck {
        /// Operation
        operation: OperationId,
        /// State it is stuck in
        state: MigrationState,
    },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    /// Operations created
    pub requests_created: u64,
    /// Requests turned away for an active operation
    pub requests_conflicting: u64,
    /// Commit decisions applied
    pub commits: u64,
    /// Rollback decisions applied
    pub rollbacks: u64,
    /// Supervisor passes run
    pub reconcile_passes: u64,
    /// State changes across all passes
    pub transitions: u64,
    /// Handler failures recorded
    pub handler_failures: u64,
    /// Operations that ended committed
    pub committed: u64,
    /// Operations that ended rolled back
    pub rolled_back: u64,
    /// Operations that ended abandoned
    pub abandoned: u64,
}

/// Final report from simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Invariants broken, in the order found
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// No invariant was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Migration Simulator Report ===");
        let _ = writeln!(
            out,
            "seed={} installations={} databases={}x{} rounds={} workers={}",
            self.config.seed,
            self.config.installations,
            self.config.databases,
            self.config.capacity,
            self.config.rounds,
            self.config.workers
        );
        let s = &self.stats;
        let _ = writeln!(
            out,
            "requests: {} created, {} conflicting",
            s.requests_created, s.requests_conflicting
        );
        let _ = writeln!(out, "decisions: {} commits, {} rollbacks", s.commits, s.rollbacks);
        let _ = writeln!(
            out,
            "reconcile: {} passes, {} transitions, {} handler failures",
            s.reconcile_passes, s.transitions, s.handler_failures
        );
        let _ = writeln!(
            out,
            "terminal: {} committed, {} rolled back, {} abandoned",
            s.committed, s.rolled_back, s.abandoned
        );
        if self.passed() {
            let _ = writeln!(out, "result: PASS");
        } else {
            let _ = writeln!(out, "result: FAIL ({} violations)", self.violations.len());
            for violation in &self.violations {
                let _ = writeln!(out, "  - {violation:?}");
            }
        }
        out
    }
}

/// Seeded migration simulator
#[derive(Debug)]
pub struct MigrationSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    clock: ManualClock,
    store: Arc<InMemoryOperationStore>,
    allocator: Arc<CapacityAllocator>,
    lifecycle: Arc<InMemoryLifecycleController>,
    copier: Arc<InMemoryCopyExecutor>,
    supervisors: Vec<(Supervisor, WorkerId)>,
    stats: SimulatorStats,
    violations: Vec<Violation>,
}

impl MigrationSimulator {
    /// Build the simulated control plane
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let clock = ManualClock::new(1_700_000_000_000);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let store = Arc::new(InMemoryOperationStore::new(Arc::clone(&shared_clock)));
        let allocator = Arc::new(CapacityAllocator::from_databases((0..config.databases).map(
            |n| MultiTenantDatabase::new(format!("db-{n}"), KIND, config.capacity, VERSION),
        )));
        let lifecycle = Arc::new(InMemoryLifecycleController::with_installations(
            (0..config.installations).map(|n| {
                Installation::new(
                    format!("inst-{n:03}"),
                    BackendDescriptor::dedicated(DatabaseKind::SingleTenantRdsPostgres),
                    VERSION,
                )
            }),
        ));
        let copier = Arc::new(InMemoryCopyExecutor::new().with_polls(1));
        let leases = Arc::new(LeaseTable::new(Arc::clone(&shared_clock)));

        let supervisor_config = SupervisorConfig::new()
            .with_max_attempts(config.max_attempts)
            .with_backoff_ms(10, 40)
            .with_wait_timeouts_ms(60_000, 60_000);
        let supervisors = (0..config.workers.max(1))
            .map(|n| {
                let supervisor = Supervisor::new(
                    Arc::clone(&store) as Arc<dyn OperationStore>,
                    Arc::clone(&allocator),
                    Arc::clone(&lifecycle) as Arc<dyn LifecycleController>,
                    Arc::clone(&copier) as Arc<dyn CopyExecutor>,
                    Arc::clone(&shared_clock),
                    supervisor_config.clone(),
                )
                .with_leases(Arc::clone(&leases));
                (supervisor, WorkerId::new(format!("sim-worker-{n}")))
            })
            .collect();

        Self {
            config,
            rng,
            clock,
            store,
            allocator,
            lifecycle,
            copier,
            supervisors,
            stats: SimulatorStats::default(),
            violations: Vec::new(),
        }
    }

    /// Run every round, then drain
    pub async fn run(mut self) -> SimulatorReport {
        for _ in 0..self.config.rounds {
            self.issue_requests();
            self.inject_copy_failures();
            self.reconcile_pass().await;
            self.decide(false);
            self.clock.advance_millis(50);
            self.check_invariants();
        }
        self.drain().await;

        SimulatorReport {
            config: self.config,
            stats: self.stats,
            violations: self.violations,
        }
    }

    fn issue_requests(&mut self) {
        for n in 0..self.config.installations {
            if !self.rng.gen_bool(self.config.request_rate) {
                continue;
            }
            let id = InstallationId::new(format!("inst-{n:03}"));
            let Some(installation) = self.lifecycle.get(&id) else {
                continue;
            };
            let current = installation.backend.slot_database().cloned();

            let pinned = if self.rng.gen_bool(0.5) {
                let db = DatabaseId::new(format!("db-{}", self.rng.gen_range(0..self.config.databases)));
                if Some(&db) == current.as_ref() {
                    continue;
                }
                Some(db)
            } else {
                None
            };
            let destination = match pinned {
                Some(db) => BackendDescriptor::multi_tenant(KIND, db),
                None => BackendDescriptor::dedicated(KIND),
            };

            let op = MigrationOperation::new(
                id,
                installation.backend.clone(),
                destination,
                self.clock.now_millis(),
            );
            match self.store.create(op) {
                Ok(_) => self.stats.requests_created += 1,
                Err(StoreError::ConflictingOperation { .. }) => self.stats.requests_conflicting += 1,
                Err(err) => tracing::error!(error = %err, "unexpected create failure"),
            }
        }
    }

    fn inject_copy_failures(&mut self) {
        for n in 0..self.config.installations {
            let id = InstallationId::new(format!("inst-{n:03}"));
            if self.rng.gen_bool(self.config.copy_failure_rate) {
                self.copier.fail_installation(id);
            } else {
                self.copier.heal_installation(&id);
            }
        }
    }

    async fn reconcile_pass(&mut self) {
        let passes = self
            .supervisors
            .iter()
            .map(|(supervisor, worker)| supervisor.run_once(worker));
        let reports = futures::future::join_all(passes).await;
        for report in reports {
            self.stats.reconcile_passes += 1;
            self.stats.transitions += report.advanced as u64;
            self.stats.handler_failures += report.failures as u64;
        }
    }

    /// Operator decisions on `migrated` operations; `all` decides every one
    fn decide(&mut self, all: bool) {
        let migrated: Vec<_> = self
            .store
            .list_active()
            .into_iter()
            .filter(|op| op.state == MigrationState::Migrated)
            .collect();
        for op in migrated {
            if !all && !self.rng.gen_bool(0.5) {
                continue;
            }
            let commit = self.rng.gen_bool(self.config.commit_rate);
            let event = if commit {
                MigrationEvent::CommitRequested
            } else {
                MigrationEvent::RollbackRequested
            };
            let result = self.store.compare_and_swap(op.id, op.version, &mut |record| {
                record.state = state_machine::apply(record.state, event)?.state();
                Ok(())
            });
            if result.is_ok() {
                if commit {
                    self.stats.commits += 1;
                } else {
                    self.stats.rollbacks += 1;
                }
            }
        }
    }

    async fn drain(&mut self) {
        for n in 0..self.config.installations {
            self.copier
                .heal_installation(&InstallationId::new(format!("inst-{n:03}")));
        }
        for _ in 0..200 {
            if self.store.list_active().is_empty() {
                break;
            }
            self.reconcile_pass().await;
            self.decide(true);
            self.clock.advance_millis(50);
            self.check_invariants();
        }

        for op in self.store.snapshot() {
            match op.state {
                MigrationState::Committed => self.stats.committed += 1,
                MigrationState::RolledBack => self.stats.rolled_back += 1,
                MigrationState::Abandoned => self.stats.abandoned += 1,
                state => self.violations.push(Violation::Stuck {
                    operation: op.id,
                    state,
                }),
            }
        }
    }

    fn check_invariants(&mut self) {
        let operations = self.store.snapshot();
        let by_id: HashMap<_, _> = operations.iter().map(|op| (op.id, op)).collect();

        let mut active: HashMap<&InstallationId, usize> = HashMap::new();
        for op in operations.iter().filter(|op| op.state.is_active()) {
            *active.entry(&op.installation_id).or_default() += 1;
        }
        for (installation, count) in active {
            if count > 1 {
                self.violations.push(Violation::MultipleActive {
                    installation: installation.clone(),
                    count,
                });
            }
        }

        for database in self.allocator.snapshot() {
            if database.occupied() > database.capacity {
                self.violations.push(Violation::CapacityExceeded {
                    database: database.id.clone(),
                    occupied: database.occupied(),
                    capacity: database.capacity,
                });
            }
            for handle in database.slots.values() {
                let Some(operation) = handle.operation_id else {
                    continue;
                };
                let owned = by_id.get(&operation).is_some_and(|op| {
                    op.state == MigrationState::Committed
                        || (op.state.is_active() && op.slot.as_ref() == Some(handle))
                });
                if !owned {
                    self.violations.push(Violation::OrphanSlot {
                        database: database.id.clone(),
                        installation: handle.installation_id.clone(),
                        operation,
                    });
                }
            }
        }
    }
}
