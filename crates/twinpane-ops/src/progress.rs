//! Progress reporting types for file operations.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::precalc::PreCalcTotals;
use crate::task::TaskPhase;

/// Window used to measure throughput.
const RATE_WINDOW: Duration = Duration::from_secs(2);

/// How a top-level item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemEnd {
    Completed { folder: bool },
    Skipped,
    Failed,
    Halted,
}

/// Live counters of one task, guarded by the task's progress lock.
#[derive(Debug)]
pub(crate) struct ProgressCounters {
    total_items: u64,
    completed_items: u64,
    completed_files: u64,
    completed_folders: u64,
    skipped_items: u64,
    failed_items: u64,
    completed_bytes: u64,
    in_flight_bytes: u64,
    /// Every byte ever moved, including rolled back ones; only feeds the rate.
    moved_bytes: u64,
    current: Option<PathBuf>,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressCounters {
    pub fn new(total_items: u64) -> Self {
        Self {
            total_items,
            completed_items: 0,
            completed_files: 0,
            completed_folders: 0,
            skipped_items: 0,
            failed_items: 0,
            completed_bytes: 0,
            in_flight_bytes: 0,
            moved_bytes: 0,
            current: None,
            samples: VecDeque::new(),
        }
    }

    pub fn set_current(&mut self, path: Option<PathBuf>) {
        self.current = path;
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.in_flight_bytes += bytes;
        self.moved_bytes += bytes;
        self.sample();
    }

    /// Forget bytes of a transfer that did not complete.
    pub fn rollback(&mut self, bytes: u64) {
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(bytes);
    }

    /// Settle a top-level item that accounted `bytes` while it ran.
    pub fn finish_item(&mut self, end: ItemEnd, bytes: u64) {
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(bytes);
        match end {
            ItemEnd::Completed { folder } => {
                self.completed_items += 1;
                self.completed_bytes += bytes;
                if folder {
                    self.completed_folders += 1;
                } else {
                    self.completed_files += 1;
                }
            }
            ItemEnd::Skipped => self.skipped_items += 1,
            ItemEnd::Failed => self.failed_items += 1,
            ItemEnd::Halted => {}
        }
    }

    fn sample(&mut self) {
        let now = Instant::now();
        self.samples.push_back((now, self.moved_bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > RATE_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn bytes_per_second(&self) -> u64 {
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        // Stale samples mean nothing moved lately.
        if last_at.elapsed() > RATE_WINDOW {
            return 0;
        }
        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0;
        }
        ((last - first) as f64 / elapsed) as u64
    }

    pub fn completed_items(&self) -> u64 {
        self.completed_items
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }
}

/// Point-in-time view of a task for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub phase: TaskPhase,
    /// Top-level items of the request.
    pub total_items: u64,
    pub completed_items: u64,
    pub completed_files: u64,
    pub completed_folders: u64,
    pub skipped_items: u64,
    pub failed_items: u64,
    pub in_flight_items: usize,
    /// Bytes of completed items.
    pub completed_bytes: u64,
    /// Completed bytes plus bytes of items still running.
    pub transferred_bytes: u64,
    pub pre_calc: PreCalcTotals,
    pub bytes_per_second: u64,
    pub desired_speed_limit: u64,
    pub effective_speed_limit: u64,
    pub current_item: Option<PathBuf>,
    pub warning_count: u64,
    pub error_count: u64,
}

impl ProgressSnapshot {
    pub(crate) fn from_counters(counters: &ProgressCounters, phase: TaskPhase) -> Self {
        Self {
            phase,
            total_items: counters.total_items,
            completed_items: counters.completed_items,
            completed_files: counters.completed_files,
            completed_folders: counters.completed_folders,
            skipped_items: counters.skipped_items,
            failed_items: counters.failed_items,
            in_flight_items: 0,
            completed_bytes: counters.completed_bytes,
            transferred_bytes: counters.completed_bytes + counters.in_flight_bytes,
            pre_calc: PreCalcTotals::default(),
            bytes_per_second: counters.bytes_per_second(),
            desired_speed_limit: 0,
            effective_speed_limit: 0,
            current_item: counters.current.clone(),
            warning_count: 0,
            error_count: 0,
        }
    }

    /// Byte total when pre-calculation finished, otherwise none.
    pub fn total_bytes(&self) -> Option<u64> {
        self.pre_calc.completed.then_some(self.pre_calc.totals.total_bytes)
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    ///
    /// Uses bytes when the byte total is known and item counts otherwise.
    pub fn percentage(&self) -> f64 {
        match self.total_bytes() {
            Some(total) if total > 0 => {
                (self.transferred_bytes.min(total) as f64 / total as f64) * 100.0
            }
            _ if self.total_items > 0 => {
                let done = self.completed_items + self.skipped_items + self.failed_items;
                (done as f64 / self.total_items as f64) * 100.0
            }
            _ => 0.0,
        }
    }
}
