//! Busy-wait locks (spec.md §4.4).
//!
//! [`Spinlock`] is the plain acquire/release primitive. [`IrqSpinlock`]
//! additionally masks interrupts on acquire and -- crucially -- drains the
//! local CPU's pending TLB-shootdown queue while spinning, so a CPU
//! holding a paging lock can never deadlock against a shootdown IPI sent
//! by a peer that is itself waiting on that same lock (spec.md §4.2, §5).

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A single-word busy-wait lock.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `Spinlock` only grants access to its contents through `lock()`,
// which enforces mutual exclusion via the atomic flag.
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(SpinlockGuard { lock: self })
    }

    /// # Safety
    /// Caller must hold the lock and must not have an outstanding
    /// [`SpinlockGuard`] for it.
    unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies exclusive access to `data`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies exclusive access to `data`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard is the sole proof of ownership of the lock,
        // and it is about to go out of scope.
        unsafe { self.lock.force_unlock() };
    }
}

/// A [`Spinlock`] that additionally masks interrupts for the duration of
/// the critical section and drains pending cross-CPU shootdown work while
/// spinning to acquire.
pub struct IrqSpinlock<T: ?Sized> {
    inner: Spinlock<T>,
}

unsafe impl<T: ?Sized + Send> Sync for IrqSpinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqSpinlock<T> {}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Spinlock::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let was_enabled = crate::arch::disable_interrupts();
        loop {
            if let Some(inner) = self.inner.try_lock() {
                return IrqSpinlockGuard {
                    inner: Some(inner),
                    was_enabled,
                };
            }
            // Draining here -- rather than only after acquiring -- is what
            // prevents the deadlock: a peer's shootdown IPI for an address
            // space we are about to edit must still be able to make
            // progress even though our interrupts are masked.
            crate::arch::drain_pending_ipi_work();
            core::hint::spin_loop();
        }
    }
}

pub struct IrqSpinlockGuard<'a, T: ?Sized> {
    inner: Option<SpinlockGuard<'a, T>>,
    was_enabled: bool,
}

impl<T: ?Sized> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<T: ?Sized> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

impl<T: ?Sized> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.take();
        crate::arch::restore_interrupts(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion_observed_by_try_lock() {
        let lock = Spinlock::new(0u32);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn guard_deref_mut_writes_through() {
        let lock = Spinlock::new(10u32);
        *lock.lock() += 5;
        assert_eq!(*lock.lock(), 15);
    }
}
