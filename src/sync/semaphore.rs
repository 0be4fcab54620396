//! Counting semaphore (spec.md §4.4). Backs the channel ring's insertion
//! and removal counters (spec.md §4.5) as well as general-purpose resource
//! counting.

use core::sync::atomic::{AtomicU64, Ordering};

use super::wait_queue::{park, park_interruptible, WaitQueue};
use crate::error::{ErrorKind, KernelResult};

/// Unsigned counter plus a wait queue. `down` blocks while the count is
/// zero; `up` always succeeds and wakes at most one waiter, and only when
/// the count transitions 0→1 (spec.md §4.4) -- a waiter can only ever be
/// blocked on a zero count, so any other transition has nobody to wake.
pub struct Semaphore {
    count: AtomicU64,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: u64) -> Self {
        Self {
            count: AtomicU64::new(initial),
            waiters: WaitQueue::new(),
        }
    }

    /// Decrement without blocking. Returns `temporary_outage` if the count
    /// is currently zero.
    pub fn try_down(&self) -> KernelResult<()> {
        loop {
            let current = self.count.load(Ordering::Relaxed);
            if current == 0 {
                return Err(ErrorKind::TemporaryOutage);
            }
            if self
                .count
                .compare_exchange_weak(current, current - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Decrement, blocking until the count is positive.
    pub fn down(&self) {
        loop {
            if self.try_down().is_ok() {
                return;
            }
            park(&self.waiters);
        }
    }

    /// As [`down`](Self::down), but returns `signaled` if the calling
    /// thread was marked for interruption before it went to sleep.
    pub fn down_interruptible(&self) -> KernelResult<()> {
        loop {
            if self.try_down().is_ok() {
                return Ok(());
            }
            park_interruptible(&self.waiters)?;
        }
    }

    /// Increment, waking one waiter iff the count transitioned 0→1.
    pub fn up(&self) {
        let previous = self.count.fetch_add(1, Ordering::Release);
        if previous == 0 {
            self.waiters.wake_n(1);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_down_drains_initial_count() {
        let sem = Semaphore::new(2);
        assert!(sem.try_down().is_ok());
        assert!(sem.try_down().is_ok());
        assert_eq!(sem.try_down(), Err(ErrorKind::TemporaryOutage));
    }

    #[test]
    fn up_restores_count_for_try_down() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.try_down(), Err(ErrorKind::TemporaryOutage));
        sem.up();
        assert!(sem.try_down().is_ok());
    }

    #[test]
    fn up_wakes_a_parked_waiter() {
        let sem = Semaphore::new(0);
        let handle = sem.waiters.add(|| {});
        sem.up();
        assert!(!sem.waiters.remove(handle));
    }
}
