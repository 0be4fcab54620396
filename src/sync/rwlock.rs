//! Reader/writer lock (spec.md §4.4): a single packed 64-bit state word
//! instead of separate reader-count and writer-flag atomics, so every
//! transition is a single compare-exchange.

use core::sync::atomic::{AtomicU64, Ordering};

use super::wait_queue::{park, park_interruptible, WaitQueue};
use crate::error::KernelResult;

const WRITE_LOCKED: u64 = 1 << 63;
const WRITERS_WAITING: u64 = 1 << 62;
const READER_MASK: u64 = WRITERS_WAITING - 1;

/// Bit 63: write-locked. Bit 62: writers waiting (readers park behind a
/// queued writer rather than starving it). Bits 0..61: reader count.
pub struct RwLock {
    state: AtomicU64,
    readers: WaitQueue,
    writers: WaitQueue,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
        }
    }

    /// Acquire for reading without blocking. Fails if a writer holds the
    /// lock, or if a writer is queued (writer-preferred: a flood of
    /// readers cannot starve a waiting writer).
    pub fn try_read(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & (WRITE_LOCKED | WRITERS_WAITING) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn read(&self) {
        while !self.try_read() {
            park(&self.readers);
        }
    }

    pub fn read_interruptible(&self) -> KernelResult<()> {
        while !self.try_read() {
            park_interruptible(&self.readers)?;
        }
        Ok(())
    }

    /// Release one reader. If the count drops to zero and a writer is
    /// queued, wakes exactly one writer; otherwise nothing is waiting that
    /// a reader release could unblock.
    pub fn unlock_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        let remaining = (previous - 1) & READER_MASK;
        if remaining == 0 && previous & WRITERS_WAITING != 0 {
            self.writers.wake_n(1);
        }
    }

    /// Acquire for writing without blocking. Fails if any reader or writer
    /// already holds the lock. A pending `WRITERS_WAITING` bit does not
    /// block acquisition -- it only tells readers to back off -- and is
    /// cleared as part of a successful acquire.
    pub fn try_write(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & (WRITE_LOCKED | READER_MASK) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                WRITE_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn write(&self) {
        loop {
            if self.try_write() {
                return;
            }
            self.state.fetch_or(WRITERS_WAITING, Ordering::Relaxed);
            park(&self.writers);
        }
    }

    pub fn write_interruptible(&self) -> KernelResult<()> {
        loop {
            if self.try_write() {
                return Ok(());
            }
            self.state.fetch_or(WRITERS_WAITING, Ordering::Relaxed);
            park_interruptible(&self.writers)?;
        }
    }

    /// Release the write lock. On unlock: if readers are parked, wake all
    /// of them (readers can run concurrently); otherwise wake one queued
    /// writer.
    pub fn unlock_write(&self) {
        self.state.store(0, Ordering::Release);
        if !self.readers.is_empty() {
            self.readers.wake_all();
        } else {
            self.writers.wake_n(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers_share_the_lock() {
        let lock = RwLock::new();
        assert!(lock.try_read());
        assert!(lock.try_read());
        assert!(!lock.try_write());
        lock.unlock_read();
        lock.unlock_read();
        assert!(lock.try_write());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new();
        assert!(lock.try_write());
        assert!(!lock.try_read());
        lock.unlock_write();
        assert!(lock.try_read());
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = RwLock::new();
        assert!(lock.try_read());
        lock.state.fetch_or(WRITERS_WAITING, Ordering::Relaxed);
        assert!(!lock.try_read());
        lock.unlock_read();
    }
}
