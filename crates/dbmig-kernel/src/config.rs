//! Supervisor configuration
//!
//! Loaded from TOML; every field has a default so a partial file is fine.
//!
//! ```toml
//! poll_interval_ms = 2000
//! lease_ttl_ms = 30000
//! max_attempts = 3
//! backoff_base_ms = 1000
//! backoff_cap_ms = 60000
//! ```

use dbmig_model::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconciliation supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Delay between reconciliation passes
    pub poll_interval_ms: u64,
    /// Lease duration per installation
    pub lease_ttl_ms: u64,
    /// Failed attempts before an operation is abandoned
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_base_ms: u64,
    /// Retry delay ceiling
    pub backoff_cap_ms: u64,
    /// Deadline for each external call
    pub call_timeout_ms: u64,
    /// How long an installation may stay pending quiesce
    pub quiesce_timeout_ms: u64,
    /// How long a copy job may stay in progress
    pub copy_timeout_ms: u64,
    /// Concurrent worker tasks
    pub workers: usize,
}

impl SupervisorConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// With lease TTL
    #[inline]
    #[must_use]
    pub fn with_lease_ttl_ms(mut self, ms: u64) -> Self {
        self.lease_ttl_ms = ms;
        self
    }

    /// With attempt ceiling
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With backoff base and cap
    #[inline]
    #[must_use]
    pub fn with_backoff_ms(mut self, base: u64, cap: u64) -> Self {
        self.backoff_base_ms = base;
        self.backoff_cap_ms = cap;
        self
    }

    /// With external call timeout
    #[inline]
    #[must_use]
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    /// With quiesce and copy wait limits
    #[inline]
    #[must_use]
    pub fn with_wait_timeouts_ms(mut self, quiesce: u64, copy: u64) -> Self {
        self.quiesce_timeout_ms = quiesce;
        self.copy_timeout_ms = copy;
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Parse TOML and validate
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::InvalidValue` if validation fails
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and validate
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - as [`SupervisorConfig::from_toml_str`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("lease_ttl_ms", self.lease_ttl_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("quiesce_timeout_ms", self.quiesce_timeout_ms),
            ("copy_timeout_ms", self.copy_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers",
                reason: "must be greater than zero".into(),
            });
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                field: "backoff_cap_ms",
                reason: format!("{} is below backoff_base_ms {}", self.backoff_cap_ms, self.backoff_base_ms),
            });
        }
        if self.lease_ttl_ms <= self.call_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "lease_ttl_ms",
                reason: "must exceed call_timeout_ms so a lease outlives one handler call".into(),
            });
        }
        Ok(())
    }

    /// Retry delay after `attempt` failures: `base * 2^(attempt-1)`, capped
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        self.backoff_base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.backoff_cap_ms)
    }

    /// Poll interval as a duration
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Call timeout as a duration
    #[inline]
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            lease_ttl_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            call_timeout_ms: 10_000,
            quiesce_timeout_ms: 300_000,
            copy_timeout_ms: 3_600_000,
            workers: 4,
        }
    }
}
