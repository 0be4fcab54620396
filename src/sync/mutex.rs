//! Recursive owner-tracked mutex (spec.md §4.4).
//!
//! Unlike [`Semaphore`](super::Semaphore), a mutex remembers *who* holds
//! it: the owning thread may lock it again without blocking (recursion
//! depth increments), and only the owner may unlock it.

use core::sync::atomic::{AtomicU64, Ordering};

use super::wait_queue::{park, park_interruptible, WaitQueue};
use crate::error::KernelResult;
use crate::sched::ThreadId;

const NO_OWNER: u64 = 0;
/// Identity used for `current_thread() == None` (no scheduler installed,
/// or called from a context with no associated thread). Distinct from
/// `NO_OWNER` so "unlocked" and "locked by an untracked caller" never
/// collide.
const ANONYMOUS: u64 = u64::MAX;

/// Owner thread id + recursion depth, backed by a wait queue for the
/// first-come FIFO waiter woken on release (spec.md §4.4). Using a mutex
/// outside threaded context (no scheduler installed) is a programmer
/// error the teacher's equivalent also leaves unchecked; callers in that
/// regime get plain busy-wait semantics instead of a panic.
pub struct Mutex {
    owner: AtomicU64,
    depth: AtomicU64,
    waiters: WaitQueue,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicU64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    fn current_thread(&self) -> Option<ThreadId> {
        crate::sched::current().and_then(|s| s.current_thread())
    }

    /// Attempt to acquire without blocking. Succeeds immediately if the
    /// calling thread already owns the lock (recursion).
    ///
    /// With no scheduler installed, every caller maps to the same
    /// [`ANONYMOUS`] identity, so distinct anonymous callers are
    /// indistinguishable from recursive calls by the same thread. Using a
    /// mutex outside threaded context is a programmer error (spec.md
    /// §4.4); this is the shape that error takes here rather than a
    /// dedicated check.
    pub fn try_lock(&self) -> bool {
        let me = self.current_thread().unwrap_or(ANONYMOUS);
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.store(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Acquire, blocking until available.
    pub fn lock(&self) {
        while !self.try_lock() {
            park(&self.waiters);
        }
    }

    /// As [`lock`](Self::lock), but returns `signaled` if the calling
    /// thread was marked for interruption before it went to sleep.
    pub fn lock_interruptible(&self) -> KernelResult<()> {
        while !self.try_lock() {
            park_interruptible(&self.waiters)?;
        }
        Ok(())
    }

    /// Release one level of recursion. Unlock by a thread that does not
    /// hold the lock at all is an invariant violation, not a representable
    /// error (spec.md §7): it goes through [`crate::error::panic_fatal`].
    pub fn unlock(&self) -> KernelResult<()> {
        let me = self.current_thread().unwrap_or(ANONYMOUS);
        if self.owner.load(Ordering::Acquire) != me {
            crate::error::panic_fatal("mutex unlock by a non-owner");
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Release);
            self.waiters.wake_n(1);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_unlock_round_trips() {
        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(m.is_locked());
        assert!(m.unlock().is_ok());
        assert!(!m.is_locked());
    }

    // Unlock by a non-owner is a fatal invariant violation (`panic_fatal`,
    // which never returns), not a representable error -- nothing here
    // exercises that path, matching how double-free and double-unlock are
    // left untested elsewhere in this core.

    // Recursive-acquire depth tracking is exercised by the process-level
    // integration tests, where distinct real thread ids are available;
    // under a unit test with no scheduler installed every caller maps to
    // the same identity, which would make a recursion assertion here
    // meaningless.
}
