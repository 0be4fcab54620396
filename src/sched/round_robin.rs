//! Reference [`Scheduler`] implementation: round-robin, no priorities
//! (spec.md §4.7 leaves priority scheduling out of scope for this core).

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{Scheduler, ThreadId};
use crate::sync::{Spinlock, WaitQueue};

struct ThreadState {
    interrupted: AtomicBool,
    /// Flipped by a wake callback enrolled on the wait queue this thread is
    /// parked on; `wait_locked` spins on it rather than performing a real
    /// context switch, since this core does not implement one.
    runnable: AtomicBool,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            runnable: AtomicBool::new(true),
        }
    }
}

/// Round-robin scheduler over a fixed set of registered threads. Threads
/// must be registered with [`RoundRobin::register`] before they can be the
/// target of `current_thread` bookkeeping; unregistered ids are tolerated
/// by `resume`/`mark_interrupted`/etc. as no-ops, matching a kill race
/// against an already-reaped thread.
pub struct RoundRobin {
    current: AtomicU64,
    ready: Spinlock<VecDeque<ThreadId>>,
    threads: Spinlock<BTreeMap<ThreadId, ThreadState>>,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobin {
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            ready: Spinlock::new(VecDeque::new()),
            threads: Spinlock::new(BTreeMap::new()),
        }
    }

    /// Register a new thread as ready and, if no thread is current yet,
    /// make it current.
    pub fn register(&self, thread: ThreadId) {
        self.threads.lock().insert(thread, ThreadState::new());
        self.ready.lock().push_back(thread);
        self.current
            .compare_exchange(0, thread, Ordering::AcqRel, Ordering::Relaxed)
            .ok();
    }

    /// Drop all bookkeeping for `thread` (it has fully exited).
    pub fn retire(&self, thread: ThreadId) {
        self.threads.lock().remove(&thread);
        self.ready.lock().retain(|&t| t != thread);
    }

    /// Round-robin to the next ready thread, returning its id.
    pub fn pick_next(&self) -> Option<ThreadId> {
        let mut ready = self.ready.lock();
        let next = ready.pop_front()?;
        ready.push_back(next);
        self.current.store(next, Ordering::Release);
        Some(next)
    }
}

impl Scheduler for RoundRobin {
    fn current_thread(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn mark_interrupted(&self, thread: ThreadId) {
        if let Some(state) = self.threads.lock().get(&thread) {
            state.interrupted.store(true, Ordering::Release);
        }
    }

    fn marked_interrupted(&self, thread: ThreadId) -> bool {
        self.threads
            .lock()
            .get(&thread)
            .map(|state| state.interrupted.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }

    fn wait_locked(&self, thread: ThreadId, _wait_queue: &WaitQueue) {
        self.suspend(thread);
    }

    fn resume(&self, thread: ThreadId) {
        let threads = self.threads.lock();
        if let Some(state) = threads.get(&thread) {
            state.runnable.store(true, Ordering::Release);
        }
        drop(threads);
        let mut ready = self.ready.lock();
        if !ready.contains(&thread) {
            ready.push_back(thread);
        }
    }

    fn suspend(&self, thread: ThreadId) {
        {
            let threads = self.threads.lock();
            if let Some(state) = threads.get(&thread) {
                state.runnable.store(false, Ordering::Release);
            } else {
                return;
            }
        }
        self.ready.lock().retain(|&t| t != thread);
        loop {
            let runnable = {
                let threads = self.threads.lock();
                threads
                    .get(&thread)
                    .map(|s| s.runnable.load(Ordering::Acquire))
                    .unwrap_or(true)
            };
            if runnable {
                return;
            }
            crate::arch::drain_pending_ipi_work();
            core::hint::spin_loop();
        }
    }

    fn kill(&self, thread: ThreadId) {
        self.mark_interrupted(thread);
        self.resume(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_pick_next_round_robins() {
        let sched = RoundRobin::new();
        sched.register(1);
        sched.register(2);
        assert_eq!(sched.pick_next(), Some(1));
        assert_eq!(sched.pick_next(), Some(2));
        assert_eq!(sched.pick_next(), Some(1));
    }

    #[test]
    fn mark_interrupted_is_observed_once() {
        let sched = RoundRobin::new();
        sched.register(7);
        assert!(!sched.marked_interrupted(7));
        sched.mark_interrupted(7);
        assert!(sched.marked_interrupted(7));
        assert!(!sched.marked_interrupted(7));
    }

    #[test]
    fn retire_removes_from_ready_queue() {
        let sched = RoundRobin::new();
        sched.register(3);
        sched.register(4);
        sched.retire(3);
        assert_eq!(sched.pick_next(), Some(4));
        assert_eq!(sched.pick_next(), Some(4));
    }
}
