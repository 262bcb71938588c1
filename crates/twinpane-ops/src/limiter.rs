//! Per-task transfer throttle.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Smallest non-zero limit, in bytes per second.
pub const MIN_SPEED_LIMIT: u64 = 16 * 1024;

/// Longest sleep before a waiter re-checks the limit and its stop hook.
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Smallest chunk handed out while a limit is set.
const MIN_LIMITED_CHUNK: u64 = 4096;

/// The limit actually applied for a desired one (0 = unlimited).
pub fn effective_limit(desired: u64) -> u64 {
    if desired == 0 {
        0
    } else {
        desired.max(MIN_SPEED_LIMIT)
    }
}

#[derive(Debug)]
struct Bucket {
    desired: u64,
    limit: u64,
    /// Bytes that may be sent right now; negative while in debt.
    balance: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let gained = now.duration_since(self.last).as_secs_f64() * self.limit as f64;
        self.last = now;
        // At most one second of burst.
        self.balance = (self.balance + gained).min(self.limit as f64);
    }
}

/// Token bucket shared by the transfer loops of one task.
#[derive(Debug)]
pub(crate) struct SpeedLimiter {
    bucket: Mutex<Bucket>,
    changed: Condvar,
}

impl SpeedLimiter {
    pub fn new(desired: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                desired,
                limit: effective_limit(desired),
                balance: 0.0,
                last: Instant::now(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Change the limit; waiters re-evaluate immediately.
    pub fn set_limit(&self, desired: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.desired = desired;
        bucket.limit = effective_limit(desired);
        let cap = bucket.limit as f64;
        bucket.balance = if bucket.limit == 0 {
            0.0
        } else {
            bucket.balance.clamp(-cap, cap)
        };
        drop(bucket);
        self.changed.notify_all();
    }

    pub fn desired(&self) -> u64 {
        self.bucket.lock().desired
    }

    pub fn limit(&self) -> u64 {
        self.bucket.lock().limit
    }

    /// Chunk length to use so a single chunk never buys more than a quarter
    /// second of budget.
    pub fn chunk_len(&self, chunk_size: usize) -> usize {
        match self.limit() {
            0 => chunk_size,
            limit => chunk_size.min((limit / 4).max(MIN_LIMITED_CHUNK) as usize),
        }
    }

    /// Charge `bytes` and block until the bucket is out of debt.
    ///
    /// Returns `false` when `should_stop` fired while waiting.
    pub fn acquire_blocking(&self, bytes: usize, should_stop: &dyn Fn() -> bool) -> bool {
        let mut bucket = self.bucket.lock();
        if bucket.limit == 0 {
            return true;
        }
        bucket.refill();
        bucket.balance -= bytes as f64;

        loop {
            if bucket.limit == 0 {
                bucket.balance = 0.0;
                return true;
            }
            bucket.refill();
            if bucket.balance >= 0.0 {
                return true;
            }
            if should_stop() {
                return false;
            }
            let owed = Duration::from_secs_f64(-bucket.balance / bucket.limit as f64);
            self.changed.wait_for(&mut bucket, owed.min(MAX_WAIT));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_effective_limit_is_clamped() {
        assert_eq!(effective_limit(0), 0);
        assert_eq!(effective_limit(1), MIN_SPEED_LIMIT);
        assert_eq!(effective_limit(1 << 20), 1 << 20);
    }

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = SpeedLimiter::new(0);
        let started = Instant::now();
        for _ in 0..100 {
            assert!(limiter.acquire_blocking(1 << 20, &|| false));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.chunk_len(1 << 20), 1 << 20);
    }

    #[test]
    fn test_limit_throttles() {
        let limiter = SpeedLimiter::new(64 * 1024);
        let chunk = limiter.chunk_len(1 << 20);
        assert_eq!(chunk, 16 * 1024);

        let started = Instant::now();
        for _ in 0..6 {
            assert!(limiter.acquire_blocking(chunk, &|| false));
        }
        // 96 KiB at 64 KiB/s.
        assert!(started.elapsed() >= Duration::from_millis(1200));
    }

    #[test]
    fn test_clearing_limit_releases_waiter() {
        let limiter = Arc::new(SpeedLimiter::new(MIN_SPEED_LIMIT));
        let waiter = {
            let limiter = limiter.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                assert!(limiter.acquire_blocking(1 << 20, &|| false));
                started.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        limiter.set_limit(0);
        assert!(waiter.join().unwrap() < Duration::from_secs(2));
        assert_eq!(limiter.desired(), 0);
    }

    #[test]
    fn test_stop_hook_interrupts() {
        let limiter = SpeedLimiter::new(MIN_SPEED_LIMIT);
        assert!(!limiter.acquire_blocking(1 << 20, &|| true));
    }
}
