//! FIFO arbitration between tasks for "wait" queue mode.

use std::sync::Arc;

use parking_lot::Mutex;

use twinpane_core::TaskId;

use crate::gate::Signal;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: TaskId,
    wait_for_others: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    wait_mode: bool,
    order: Vec<Entry>,
}

/// Live tasks in start order.
///
/// A task that waits (global wait mode, or its own `wait_for_others`) may
/// only run while it is the oldest live task. Other tasks always may.
#[derive(Debug)]
pub(crate) struct QueueArbiter {
    state: Mutex<QueueState>,
    signal: Arc<Signal>,
}

impl QueueArbiter {
    pub fn new(wait_mode: bool, signal: Arc<Signal>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                wait_mode,
                order: Vec::new(),
            }),
            signal,
        }
    }

    pub fn enqueue(&self, id: TaskId, wait_for_others: bool) {
        self.state.lock().order.push(Entry {
            id,
            wait_for_others,
        });
        self.signal.bump();
    }

    /// Release the task's slot. Idempotent.
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.order.len();
            state.order.retain(|entry| entry.id != id);
            state.order.len() != before
        };
        if removed {
            self.signal.bump();
        }
        removed
    }

    /// Switch between wait and parallel mode. Returns whether it changed.
    pub fn set_wait_mode(&self, wait: bool) -> bool {
        let changed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.wait_mode, wait) != wait
        };
        if changed {
            self.signal.bump();
        }
        changed
    }

    pub fn wait_mode(&self) -> bool {
        self.state.lock().wait_mode
    }

    pub fn may_proceed(&self, id: TaskId) -> bool {
        let state = self.state.lock();
        let Some(position) = state.order.iter().position(|entry| entry.id == id) else {
            return true;
        };
        let waits = state.wait_mode || state.order[position].wait_for_others;
        !waits || position == 0
    }

    pub fn position(&self, id: TaskId) -> Option<usize> {
        self.state.lock().order.iter().position(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter(wait: bool) -> QueueArbiter {
        QueueArbiter::new(wait, Arc::new(Signal::new()))
    }

    #[test]
    fn test_parallel_mode_lets_everyone_run() {
        let queue = arbiter(false);
        queue.enqueue(TaskId(1), false);
        queue.enqueue(TaskId(2), false);
        assert!(queue.may_proceed(TaskId(1)));
        assert!(queue.may_proceed(TaskId(2)));
    }

    #[test]
    fn test_wait_mode_runs_oldest_only() {
        let queue = arbiter(true);
        queue.enqueue(TaskId(1), false);
        queue.enqueue(TaskId(2), false);
        assert!(queue.may_proceed(TaskId(1)));
        assert!(!queue.may_proceed(TaskId(2)));

        assert!(queue.remove(TaskId(1)));
        assert!(!queue.remove(TaskId(1)));
        assert!(queue.may_proceed(TaskId(2)));
    }

    #[test]
    fn test_per_request_wait_in_parallel_mode() {
        let queue = arbiter(false);
        queue.enqueue(TaskId(1), false);
        queue.enqueue(TaskId(2), true);
        queue.enqueue(TaskId(3), false);
        assert!(!queue.may_proceed(TaskId(2)));
        assert!(queue.may_proceed(TaskId(3)));
        assert_eq!(queue.position(TaskId(2)), Some(1));
    }

    #[test]
    fn test_switching_to_parallel_releases_waiters() {
        let queue = arbiter(true);
        queue.enqueue(TaskId(1), false);
        queue.enqueue(TaskId(2), false);
        assert!(queue.set_wait_mode(false));
        assert!(!queue.set_wait_mode(false));
        assert!(queue.may_proceed(TaskId(2)));
    }
}
