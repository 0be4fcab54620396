//! Per-process key-value storage (spec.md §4.6): a small registry of
//! fixed-size byte buffers keyed by a process-wide counter, with
//! synchronous destructors on clear — the per-process analogue of
//! thread-local storage.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ErrorKind, KernelResult};
use crate::sync::Spinlock;

/// Key returned by [`register`]. Stable for the lifetime of the system;
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey(pub u64);

/// Run synchronously, from the clearing context, immediately before the
/// slot's bytes are freed.
pub type Destructor = fn(&mut [u8]);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, process-wide storage key (spec.md §9: "a registry of
/// typed slots keyed by a process-wide counter").
pub fn register() -> StorageKey {
    StorageKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
}

struct Slot {
    bytes: Vec<u8>,
    destructor: Destructor,
}

/// Per-[`crate::process::Process`] table of storage slots.
pub struct KvStore {
    slots: Spinlock<BTreeMap<u64, Slot>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self { slots: Spinlock::new(BTreeMap::new()) }
    }

    /// Returns the slot's current byte length and whether this call
    /// created it. When absent and `create_if_absent` is false, returns
    /// `no_such_resource`.
    pub fn lookup(
        &self,
        key: StorageKey,
        create_if_absent: bool,
        default_size: usize,
        destructor: Destructor,
    ) -> KernelResult<(usize, bool)> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key.0) {
            return Ok((slot.bytes.len(), false));
        }
        if !create_if_absent {
            return Err(ErrorKind::NoSuchResource);
        }
        slots.insert(key.0, Slot { bytes: alloc::vec![0u8; default_size], destructor });
        Ok((default_size, true))
    }

    /// Run `f` with mutable access to the slot's bytes, if present.
    pub fn with_mut<R>(&self, key: StorageKey, f: impl FnOnce(&mut [u8]) -> R) -> KernelResult<R> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&key.0).ok_or(ErrorKind::NoSuchResource)?;
        Ok(f(&mut slot.bytes))
    }

    /// Run the slot's destructor and remove it.
    pub fn clear(&self, key: StorageKey) -> KernelResult<()> {
        let mut slots = self.slots.lock();
        let mut slot = slots.remove(&key.0).ok_or(ErrorKind::NoSuchResource)?;
        (slot.destructor)(&mut slot.bytes);
        Ok(())
    }

    /// Run every slot's destructor, used when the owning process is torn
    /// down.
    pub fn clear_all(&self) {
        let mut slots = self.slots.lock();
        for (_, mut slot) in core::mem::take(&mut *slots) {
            (slot.destructor)(&mut slot.bytes);
        }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static DESTROY_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn counting_destructor(_bytes: &mut [u8]) {
        DESTROY_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn lookup_creates_on_first_call_then_finds_the_same_slot() {
        let store = KvStore::new();
        let key = register();
        let (size, created) = store.lookup(key, true, 16, counting_destructor).unwrap();
        assert_eq!(size, 16);
        assert!(created);
        let (size, created) = store.lookup(key, true, 16, counting_destructor).unwrap();
        assert_eq!(size, 16);
        assert!(!created);
    }

    #[test]
    fn lookup_without_create_on_missing_key_is_no_such_resource() {
        let store = KvStore::new();
        assert_eq!(store.lookup(StorageKey(999), false, 16, counting_destructor), Err(ErrorKind::NoSuchResource));
    }

    #[test]
    fn clear_runs_the_destructor_exactly_once() {
        let store = KvStore::new();
        let key = register();
        store.lookup(key, true, 8, counting_destructor).unwrap();
        let before = DESTROY_COUNT.load(Ordering::Relaxed);
        store.clear(key).unwrap();
        assert_eq!(DESTROY_COUNT.load(Ordering::Relaxed), before + 1);
        assert_eq!(store.clear(key), Err(ErrorKind::NoSuchResource));
    }
}
