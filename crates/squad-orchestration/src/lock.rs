//! Execution ownership locks.
//!
//! At most one orchestrator may own a given execution at a time. Ownership
//! is a lease with a TTL renewed by heartbeat; a lease that expires can be
//! taken over by a replacement instance, and the previous owner detects
//! the loss on its next renewal.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use squad_types::ExecutionId;

use crate::OrchestratorError;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-process lock registry.
///
/// A distributed deployment substitutes an external lock service behind
/// the same acquire/renew/release surface.
#[derive(Debug, Default)]
pub struct LockRegistry {
    leases: Arc<DashMap<ExecutionId, Lease>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for an execution.
    ///
    /// Fails with `LockContention` while another owner holds an unexpired
    /// lease.
    pub fn acquire(
        &self,
        execution_id: ExecutionId,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Result<LockGuard, OrchestratorError> {
        let owner = owner.into();
        let now = Instant::now();
        let mut contended = false;
        self.leases
            .entry(execution_id)
            .and_modify(|lease| {
                if lease.owner != owner && lease.expires_at > now {
                    contended = true;
                } else {
                    if lease.owner != owner {
                        debug!(execution_id = %execution_id, previous = %lease.owner, "expired lease taken over");
                    }
                    lease.owner = owner.clone();
                    lease.expires_at = now + ttl;
                }
            })
            .or_insert_with(|| Lease {
                owner: owner.clone(),
                expires_at: now + ttl,
            });
        if contended {
            return Err(OrchestratorError::LockContention(execution_id));
        }
        Ok(LockGuard {
            leases: Arc::clone(&self.leases),
            execution_id,
            owner,
            ttl,
        })
    }
}

/// Held execution lock. Dropping releases the lease if still owned.
#[derive(Debug)]
pub struct LockGuard {
    leases: Arc<DashMap<ExecutionId, Lease>>,
    execution_id: ExecutionId,
    owner: String,
    ttl: Duration,
}

impl LockGuard {
    /// Extend the lease by one TTL.
    ///
    /// Returns `false` if the lease was lost to another owner; the caller
    /// must abort its orchestration loop.
    pub fn renew(&self) -> bool {
        let now = Instant::now();
        match self.leases.get_mut(&self.execution_id) {
            Some(mut lease) if lease.owner == self.owner => {
                lease.expires_at = now + self.ttl;
                true
            }
            _ => {
                warn!(execution_id = %self.execution_id, owner = %self.owner, "execution lock lost");
                false
            }
        }
    }

    /// The guarded execution.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.leases
            .remove_if(&self.execution_id, |_, lease| lease.owner == self.owner);
    }
}
