//! Randomized invariant harness

pub mod simulator;

pub use simulator::{MigrationSimulator, SimulatorConfig, SimulatorReport, SimulatorStats, Violation};
