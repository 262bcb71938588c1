//! Bounded per-item concurrency and the bridge to the blocking pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use twinpane_core::{FsError, FsResult};

#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Hands out item slots for one task.
///
/// Per-item tasks additionally take a permit from the orchestrator-wide
/// budget, after their own slot, so waiting on the budget never holds a
/// shared permit.
#[derive(Debug)]
pub(crate) struct ItemScheduler {
    permits: Arc<Semaphore>,
    limit: usize,
    counters: Arc<InFlight>,
}

/// An occupied item slot; dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct ItemGuard {
    _permit: OwnedSemaphorePermit,
    _shared: Option<OwnedSemaphorePermit>,
    counters: Arc<InFlight>,
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ItemScheduler {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            counters: Arc::default(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a slot. `None` once the semaphores are closed.
    pub async fn acquire(&self, shared: Option<&Arc<Semaphore>>) -> Option<ItemGuard> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let shared = match shared {
            Some(budget) => Some(budget.clone().acquire_owned().await.ok()?),
            None => None,
        };

        let now = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);

        Some(ItemGuard {
            _permit: permit,
            _shared: shared,
            counters: self.counters.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

/// Run a synchronous backend call on the runtime's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> FsResult<T>
where
    F: FnOnce() -> FsResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(FsError::Cancelled),
        Err(err) => Err(FsError::backend("", format!("backend call panicked: {err}"))),
    }
}
