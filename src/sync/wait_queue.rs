//! Generic wait queue (spec.md §3, §4.4): a lock plus an ordered list of
//! suspended waiters, each holding a callback invoked exactly once on wake.
//! Every blocking primitive in this crate is built on top of this type.

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::spinlock::Spinlock;
use crate::error::{ErrorKind, KernelResult};

type Callback = Box<dyn FnOnce() + Send>;

struct WaiterEntry {
    id: u64,
    callback: Option<Callback>,
}

/// Opaque handle returned by [`WaitQueue::add`], usable with
/// [`WaitQueue::remove`] to cancel a wait before it fires (e.g. when a
/// semaphore's `down` is interrupted before it is ever woken).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterHandle(u64);

/// An ordered list of suspended waiters. A waiter is enrolled in at most
/// one queue; `wake_n(n)` invokes exactly `min(n, len())` callbacks and
/// unlinks those waiters atomically with respect to the queue's lock
/// (spec.md §8).
pub struct WaitQueue {
    waiters: Spinlock<VecDeque<WaiterEntry>>,
    next_id: AtomicU64,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enroll a waiter carrying `callback`, to be invoked exactly once
    /// when this waiter is woken (by `wake_n`) or never, if it is removed
    /// first via [`remove`](Self::remove).
    pub fn add(&self, callback: impl FnOnce() + Send + 'static) -> WaiterHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().push_back(WaiterEntry {
            id,
            callback: Some(Box::new(callback)),
        });
        WaiterHandle(id)
    }

    /// Remove a waiter before it is woken. Returns `true` if the waiter was
    /// still enrolled (its callback is dropped, not invoked); `false` if it
    /// had already been woken and unlinked by `wake_n`.
    pub fn remove(&self, handle: WaiterHandle) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.id == handle.0) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Wake up to `n` waiters in FIFO order, invoking each callback exactly
    /// once after unlinking it. Returns the number actually woken.
    ///
    /// Callbacks run with the queue's internal lock released: a wake
    /// callback is free to re-enroll on this same queue (e.g. a spurious
    /// retry) without deadlocking.
    pub fn wake_n(&self, n: usize) -> usize {
        let mut woken = 0;
        while woken < n {
            let entry = {
                let mut waiters = self.waiters.lock();
                match waiters.pop_front() {
                    Some(e) => e,
                    None => break,
                }
            };
            if let Some(callback) = entry.callback {
                callback();
            }
            woken += 1;
        }
        woken
    }

    /// Wake every waiter currently enrolled.
    pub fn wake_all(&self) -> usize {
        self.wake_n(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Park the calling thread on `wq` until woken, delegating to the
/// scheduler if one is installed; otherwise busy-idle on a local flag,
/// draining pending cross-CPU work while doing so (spec.md §4.4, for use
/// from interrupt context or before the scheduler is up).
pub fn park(wq: &WaitQueue) {
    let thread = crate::sched::current().and_then(|s| s.current_thread());
    let flag = Arc::new(AtomicBool::new(false));
    let flag_cb = flag.clone();
    wq.add(move || {
        flag_cb.store(true, Ordering::Release);
        if let (Some(t), Some(sched)) = (thread, crate::sched::current()) {
            sched.resume(t);
        }
    });
    match (thread, crate::sched::current()) {
        (Some(t), Some(sched)) => sched.wait_locked(t, wq),
        _ => {
            while !flag.load(Ordering::Acquire) {
                crate::arch::drain_pending_ipi_work();
                core::hint::spin_loop();
            }
        }
    }
}

/// As [`park`], but if the calling thread was marked for interruption
/// before it went to sleep, returns [`ErrorKind::Signaled`] instead of
/// blocking. The interrupted check and the enrollment happen in the same
/// sequence the wake callback is installed under, so a racing
/// `mark_interrupted` either lands before enrollment (caught by the check
/// below) or after (the thread is already parked and gets woken normally
/// on the next `wake_n`, observing the flag on its *next* cancellable call
/// per spec.md §4.7's cooperative cancellation model).
pub fn park_interruptible(wq: &WaitQueue) -> KernelResult<()> {
    let thread = crate::sched::current().and_then(|s| s.current_thread());
    let flag = Arc::new(AtomicBool::new(false));
    let flag_cb = flag.clone();
    let handle = wq.add(move || {
        flag_cb.store(true, Ordering::Release);
        if let (Some(t), Some(sched)) = (thread, crate::sched::current()) {
            sched.resume(t);
        }
    });

    if let Some(t) = thread {
        if let Some(sched) = crate::sched::current() {
            if sched.marked_interrupted(t) && wq.remove(handle) {
                return Err(ErrorKind::Signaled);
            }
            sched.wait_locked(t, wq);
            return Ok(());
        }
    }

    while !flag.load(Ordering::Acquire) {
        crate::arch::drain_pending_ipi_work();
        core::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn wake_n_invokes_exactly_min_n_and_len() {
        let wq = WaitQueue::new();
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let woken = woken.clone();
            wq.add(move || {
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        let count = wq.wake_n(3);
        assert_eq!(count, 3);
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        assert_eq!(wq.len(), 2);
    }

    #[test]
    fn removed_waiter_never_fires() {
        let wq = WaitQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let handle = wq.add(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wq.remove(handle));
        assert_eq!(wq.wake_all(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_after_wake_returns_false() {
        let wq = WaitQueue::new();
        let handle = wq.add(|| {});
        assert_eq!(wq.wake_n(1), 1);
        assert!(!wq.remove(handle));
    }

    #[test]
    fn fifo_order_preserved() {
        let wq = WaitQueue::new();
        let order = Arc::new(Spinlock::new(alloc::vec::Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            wq.add(move || order.lock().push(i));
        }
        wq.wake_all();
        assert_eq!(*order.lock(), alloc::vec![0, 1, 2, 3]);
    }
}
