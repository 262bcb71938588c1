//! Checkpoints where a task stops for cancellation, user pause and its queue
//! turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use twinpane_core::{FsError, FsResult, TaskId};

use crate::queue::QueueArbiter;

/// Upper bound between two re-evaluations of a blocked checkpoint.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wakes everything parked at a checkpoint, async and blocking alike.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    epoch: Mutex<u64>,
    changed: Condvar,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        *self.epoch.lock() += 1;
        self.changed.notify_all();
        self.notify.notify_waiters();
    }

    fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    fn wait_blocking(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        if *epoch == seen {
            self.changed.wait_for(&mut epoch, timeout);
        }
    }
}

enum Verdict {
    Go,
    Wait,
    Halt,
}

/// Per-task checkpoint state.
#[derive(Debug)]
pub(crate) struct Gate {
    id: TaskId,
    halt: CancellationToken,
    paused: AtomicBool,
    queue_blocked: AtomicBool,
    arbiter: Arc<QueueArbiter>,
    signal: Arc<Signal>,
}

impl Gate {
    pub fn new(
        id: TaskId,
        halt: CancellationToken,
        arbiter: Arc<QueueArbiter>,
        signal: Arc<Signal>,
    ) -> Self {
        Self {
            id,
            halt,
            paused: AtomicBool::new(false),
            queue_blocked: AtomicBool::new(false),
            arbiter,
            signal,
        }
    }

    /// Flip the user pause; returns the new state.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.paused.fetch_xor(true, Ordering::SeqCst);
        self.signal.bump();
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_queue_blocked(&self) -> bool {
        self.queue_blocked.load(Ordering::SeqCst)
    }

    pub fn arbiter(&self) -> &QueueArbiter {
        &self.arbiter
    }

    pub fn wake(&self) {
        self.signal.bump();
    }

    fn evaluate(&self, on_change: &(dyn Fn() + Sync)) -> Verdict {
        if self.halt.is_cancelled() {
            return Verdict::Halt;
        }
        let blocked = !self.arbiter.may_proceed(self.id);
        if self.queue_blocked.swap(blocked, Ordering::SeqCst) != blocked {
            on_change();
        }
        if blocked {
            return Verdict::Wait;
        }
        if self.is_paused() {
            Verdict::Wait
        } else {
            Verdict::Go
        }
    }

    /// Wait until the task may run. `on_change` fires when the queue-blocked
    /// state flips.
    pub async fn pass(&self, on_change: &(dyn Fn() + Sync)) -> FsResult<()> {
        loop {
            let notified = self.signal.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.evaluate(on_change) {
                Verdict::Go => return Ok(()),
                Verdict::Halt => return Err(FsError::Cancelled),
                Verdict::Wait => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.halt.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// [`Gate::pass`] for code running on the blocking pool.
    pub fn pass_blocking(&self, on_change: &(dyn Fn() + Sync)) -> FsResult<()> {
        self.wait_blocking(&|| false, on_change)
    }

    /// [`Gate::pass_blocking`] that also gives up with `Err(Cancelled)` once
    /// `stop` fires.
    pub fn pass_blocking_until(
        &self,
        stop: &(dyn Fn() -> bool + Sync),
        on_change: &(dyn Fn() + Sync),
    ) -> FsResult<()> {
        self.wait_blocking(stop, on_change)
    }

    fn wait_blocking(
        &self,
        stop: &(dyn Fn() -> bool + Sync),
        on_change: &(dyn Fn() + Sync),
    ) -> FsResult<()> {
        loop {
            if stop() {
                return Err(FsError::Cancelled);
            }
            let seen = self.signal.epoch();
            match self.evaluate(on_change) {
                Verdict::Go => return Ok(()),
                Verdict::Halt => return Err(FsError::Cancelled),
                Verdict::Wait => self.signal.wait_blocking(seen, POLL_INTERVAL),
            }
        }
    }
}
