//! Bounded pools for in-flight polls, pushes and fast updates.

use std::sync::Arc;

use herd_core::config::LimitsConfig;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tracing::debug;

use crate::cpu::CpuSharer;
use crate::error::{ThrottleError, ThrottleResult};

/// A named counting semaphore.
#[derive(Debug, Clone)]
pub struct Pool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held pool slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    pub in_use: usize,
    pub capacity: usize,
}

impl Pool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn acquire(&self) -> ThrottleResult<Slot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| {
                debug!(pool = self.name, "pool closed");
                ThrottleError::Closed(self.name)
            })?;
        Ok(Slot { _permit: permit })
    }

    pub fn try_acquire(&self) -> ThrottleResult<Slot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Slot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(ThrottleError::Unavailable(self.name)),
            Err(TryAcquireError::Closed) => Err(ThrottleError::Closed(self.name)),
        }
    }

    /// Wait for a slot, giving up as soon as `cancel` flips to true or its
    /// sender goes away.
    pub async fn acquire_or_cancel(&self, cancel: &mut watch::Receiver<bool>) -> ThrottleResult<Slot> {
        if *cancel.borrow_and_update() {
            return Err(self.cancelled(false));
        }
        let acquire = self.acquire();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                slot = &mut acquire => return slot,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow_and_update() {
                        return Err(self.cancelled(true));
                    }
                }
            }
        }
    }

    fn cancelled(&self, waited: bool) -> ThrottleError {
        debug!(
            pool = self.name,
            in_use = self.capacity - self.semaphore.available_permits(),
            waited,
            "pool wait cancelled"
        );
        ThrottleError::Cancelled(self.name)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            in_use: self.capacity - self.semaphore.available_permits(),
            capacity: self.capacity,
        }
    }
}

/// Every throttle a herd shares across its node tasks.
#[derive(Debug, Clone)]
pub struct Limits {
    pub cpu: CpuSharer,
    pub polls: Pool,
    pub pushes: Pool,
    pub fast_updates: Pool,
}

impl Limits {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            cpu: CpuSharer::new(config.cpu_slots),
            polls: Pool::new("poll", config.max_concurrent_polls),
            pushes: Pool::new("push", config.max_concurrent_pushes),
            fast_updates: Pool::new("fast-update", config.max_concurrent_fast_updates),
        }
    }

    pub fn pool_stats(&self) -> [PoolStats; 3] {
        [self.polls.stats(), self.pushes.stats(), self.fast_updates.stats()]
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}
