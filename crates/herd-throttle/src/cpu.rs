//! Fair, cooperative CPU sharing.
//!
//! A [`CpuTicket`] is held while a node task does CPU-bound work. It is
//! dropped before any blocking network call and re-grabbed afterwards.
//! Waiters are served in arrival order.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ThrottleError, ThrottleResult};

#[derive(Debug, Default)]
struct Counters {
    acquires: AtomicU64,
    releases: AtomicU64,
    yields: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct CpuSharer {
    semaphore: Arc<Semaphore>,
    slots: usize,
    counters: Arc<Counters>,
}

/// Point-in-time view of the sharer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub num_cpu: usize,
    pub num_running: usize,
    pub acquires: u64,
    pub releases: u64,
    pub yields: u64,
}

/// Permission to use one CPU slot. Released on drop.
#[derive(Debug)]
pub struct CpuTicket {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for CpuTicket {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
    }
}

impl CpuSharer {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            slots,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a CPU slot.
    pub async fn grab(&self) -> ThrottleResult<CpuTicket> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed("cpu"))?;
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(CpuTicket {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn try_grab(&self) -> Option<CpuTicket> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        Some(CpuTicket {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Run `f` while holding a ticket.
    pub async fn run<T>(&self, f: impl FnOnce() -> T) -> ThrottleResult<T> {
        let _ticket = self.grab().await?;
        Ok(f())
    }

    /// Give up `ticket` for the duration of `fut` and take a fresh one
    /// afterwards, queueing behind anyone who arrived meanwhile.
    pub async fn release_during<F: Future>(
        &self,
        ticket: CpuTicket,
        fut: F,
    ) -> ThrottleResult<(F::Output, CpuTicket)> {
        drop(ticket);
        self.counters.yields.fetch_add(1, Ordering::Relaxed);
        let out = fut.await;
        Ok((out, self.grab().await?))
    }

    /// Sleep without holding a ticket.
    pub async fn sleep(&self, ticket: CpuTicket, duration: Duration) -> ThrottleResult<CpuTicket> {
        let ((), ticket) = self
            .release_during(ticket, tokio::time::sleep(duration))
            .await?;
        Ok(ticket)
    }

    pub fn stats(&self) -> CpuStats {
        CpuStats {
            num_cpu: self.slots,
            num_running: self.slots - self.semaphore.available_permits(),
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            yields: self.counters.yields.load(Ordering::Relaxed),
        }
    }
}
