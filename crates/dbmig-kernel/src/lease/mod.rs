//! Per-installation leases
//!
//! A lease is a (holder, expiry) pair keyed by installation id. Only the
//! holder can renew or release it; anyone may take over a lease whose expiry
//! has passed, so a crashed worker never locks an installation out for good.
//! Every grant carries a fresh fencing token so a stale holder cannot release
//! a lease that has since been re-granted.

use crate::clock::Clock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dbmig_model::{InstallationId, LeaseError, WorkerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased installation
    pub key: InstallationId,
    /// Holder
    pub holder: WorkerId,
    /// Expiry (unix millis)
    pub expires_at: i64,
    /// Fencing token, unique per grant
    pub token: u64,
}

/// Table of live leases
#[derive(Debug)]
pub struct LeaseTable {
    leases: DashMap<InstallationId, Lease>,
    next_token: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl LeaseTable {
    /// Empty table
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            next_token: AtomicU64::new(1),
            clock,
        }
    }

    /// Acquire the lease on `key` for `ttl_ms`
    ///
    /// Re-acquiring a lease already held by `holder` extends it.
    ///
    /// # Errors
    /// - `LeaseError::Held` if another worker holds an unexpired lease
    pub fn acquire(
        &self,
        key: &InstallationId,
        holder: &WorkerId,
        ttl_ms: u64,
    ) -> Result<Lease, LeaseError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));

        match self.leases.entry(key.clone()) {
            Entry::Vacant(entry) => {
                let lease = self.grant(key, holder, expires_at);
                entry.insert(lease.clone());
                Ok(lease)
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder == *holder {
                    let renewed = Lease {
                        expires_at: current.expires_at.max(expires_at),
                        ..current.clone()
                    };
                    entry.insert(renewed.clone());
                    return Ok(renewed);
                }
                if current.expires_at > now {
                    return Err(LeaseError::Held {
                        key: key.clone(),
                        holder: current.holder.clone(),
                        expires_at: current.expires_at,
                    });
                }
                tracing::warn!(
                    installation = %key,
                    previous = %current.holder,
                    holder = %holder,
                    "taking over expired lease"
                );
                let lease = self.grant(key, holder, expires_at);
                entry.insert(lease.clone());
                Ok(lease)
            }
        }
    }

    /// Extend a held lease; expiry never moves backwards
    ///
    /// A lease that already expired is not revived: someone else may have
    /// acted on the installation in between.
    ///
    /// # Errors
    /// - `LeaseError::NotHolder` if the lease expired, was lost or was re-granted
    pub fn renew(&self, lease: &Lease, ttl_ms: u64) -> Result<Lease, LeaseError> {
        let now = self.clock.now_millis();
        let mut current = self
            .leases
            .get_mut(&lease.key)
            .filter(|current| current.token == lease.token && current.expires_at > now)
            .ok_or_else(|| LeaseError::NotHolder {
                key: lease.key.clone(),
                worker: lease.holder.clone(),
            })?;
        let extended = now.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
        current.expires_at = current.expires_at.max(extended);
        Ok(current.clone())
    }

    /// Release a held lease; a no-op if it was already lost
    pub fn release(&self, lease: &Lease) -> bool {
        self.leases
            .remove_if(&lease.key, |_, current| current.token == lease.token)
            .is_some()
    }

    /// Current lease on `key`, expired or not
    #[must_use]
    pub fn holder(&self, key: &InstallationId) -> Option<Lease> {
        self.leases.get(key).map(|l| l.clone())
    }

    /// Acquire and wrap in a guard that releases on drop
    ///
    /// # Errors
    /// Same as [`LeaseTable::acquire`].
    pub fn acquire_guard(
        self: &Arc<Self>,
        key: &InstallationId,
        holder: &WorkerId,
        ttl_ms: u64,
    ) -> Result<LeaseGuard, LeaseError> {
        let lease = self.acquire(key, holder, ttl_ms)?;
        Ok(LeaseGuard {
            table: Arc::clone(self),
            lease,
        })
    }

    fn grant(&self, key: &InstallationId, holder: &WorkerId, expires_at: i64) -> Lease {
        Lease {
            key: key.clone(),
            holder: holder.clone(),
            expires_at,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Lease released when dropped, including during unwinding
#[derive(Debug)]
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    lease: Lease,
}

impl LeaseGuard {
    /// The lease as granted; renewals do not change its token
    #[inline]
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Extend the held lease, returning it with the new expiry
    ///
    /// # Errors
    /// - `LeaseError::NotHolder` if the lease expired or was lost
    pub fn renew(&self, ttl_ms: u64) -> Result<Lease, LeaseError> {
        self.table.renew(&self.lease, ttl_ms)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.table.release(&self.lease);
    }
}
