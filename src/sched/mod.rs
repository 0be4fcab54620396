//! Thread scheduler interface (spec.md §4.7).
//!
//! This module defines the interface the rest of the crate blocks through;
//! it does not own thread control blocks (those live in [`crate::process`])
//! or perform real context switches (arch-specific, out of scope here).
//! [`round_robin::RoundRobin`] is a reference implementation sufficient to
//! exercise every blocking primitive in [`crate::sync`] cooperatively.

pub mod round_robin;

use crate::sync::{Spinlock, WaitQueue};

/// Numeric thread identifier. Opaque to everything below `process`; the
/// scheduler never interprets it beyond equality and use as a map key.
pub type ThreadId = u64;

/// Exposed to the synchronization primitives and nothing else (spec.md
/// §4.7). Implementors own the ready queue and per-thread interrupted/
/// suspended bookkeeping; callers only ever see thread ids.
pub trait Scheduler: Sync {
    /// The thread currently executing on this CPU, or `None` before the
    /// scheduler is installed (early boot) or from a context with no
    /// associated thread (an interrupt handler running on the idle stack).
    fn current_thread(&self) -> Option<ThreadId>;

    /// Flag `thread` for cancellation. Observed cooperatively the next time
    /// it passes through a cancellable blocking call.
    fn mark_interrupted(&self, thread: ThreadId);

    /// Test and clear the interrupted flag for `thread`.
    fn marked_interrupted(&self, thread: ThreadId) -> bool;

    /// Suspend `thread`, having already been enrolled on `wait_queue` by the
    /// caller. Returns once another thread has called [`resume`](Self::resume)
    /// for this thread. The scheduler is cooperative here: this call does
    /// not return control to its caller's caller until redispatched.
    fn wait_locked(&self, thread: ThreadId, wait_queue: &WaitQueue);

    /// Move `thread` from suspended back to ready.
    fn resume(&self, thread: ThreadId);

    /// Suspend `thread` unconditionally (not tied to a particular wait
    /// queue), e.g. while waiting for a child thread.
    fn suspend(&self, thread: ThreadId);

    /// Mark every thread belonging to `thread`'s process for death and wake
    /// them so each observes the kill request on its own return path.
    fn kill(&self, thread: ThreadId);
}

static SCHEDULER: Spinlock<Option<&'static dyn Scheduler>> = Spinlock::new(None);

/// Install the system scheduler. Intended to be called once, early in boot,
/// before any thread can contend on a blocking primitive.
pub fn install(scheduler: &'static dyn Scheduler) {
    *SCHEDULER.lock() = Some(scheduler);
}

/// The installed scheduler, or `None` if [`install`] has not run yet. Every
/// blocking primitive in [`crate::sync`] falls back to a busy-idle loop on a
/// local flag when this is `None`, per spec.md §4.4.
pub fn current() -> Option<&'static dyn Scheduler> {
    *SCHEDULER.lock()
}
