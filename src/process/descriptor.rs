//! Per-process descriptor table (spec.md §4.6): a small dense map from
//! integer DIDs to ref-counted kernel objects.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ErrorKind, KernelResult};
use crate::sync::Spinlock;

/// Descriptor identifier. `NO_DID` is reserved and never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Did(pub u64);

pub const NO_DID: Did = Did(u64::MAX);

/// Any object placeable in a descriptor table (channels, mappings, other
/// processes). `retain`/`release` mirror the crate-wide ref-counting
/// convention (spec.md §6): `release` reports `permanent_outage` once the
/// object is already dead rather than being called again.
pub trait DescriptorObject: Send + Sync {
    fn retain(&self);
    fn release(&self) -> KernelResult<()>;
}

struct Entry {
    object: Arc<dyn DescriptorObject>,
}

/// Per-process table. `install` always assigns the smallest unused DID so
/// low indices stay dense for processes that open and close descriptors
/// repeatedly.
pub struct DescriptorTable {
    entries: Spinlock<BTreeMap<u64, Entry>>,
    next_lowest_did: AtomicU64,
    highest_did: AtomicU64,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            entries: Spinlock::new(BTreeMap::new()),
            next_lowest_did: AtomicU64::new(0),
            highest_did: AtomicU64::new(0),
        }
    }

    /// Retain `object` and install it under the smallest free DID.
    pub fn install(&self, object: Arc<dyn DescriptorObject>) -> Did {
        object.retain();
        let mut entries = self.entries.lock();
        let mut candidate = self.next_lowest_did.load(Ordering::Relaxed);
        while entries.contains_key(&candidate) {
            candidate += 1;
        }
        entries.insert(candidate, Entry { object });
        self.next_lowest_did.store(find_next_gap(&entries, candidate + 1), Ordering::Relaxed);
        if candidate >= self.highest_did.load(Ordering::Relaxed) {
            self.highest_did.store(candidate, Ordering::Relaxed);
        }
        Did(candidate)
    }

    /// Install `object` at a caller-chosen DID (used when a child process
    /// must mirror the parent's descriptor layout, spec.md §4.6). Fails if
    /// the slot is already occupied.
    pub fn install_at(&self, did: Did, object: Arc<dyn DescriptorObject>) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&did.0) {
            return Err(ErrorKind::AlreadyInProgress);
        }
        object.retain();
        entries.insert(did.0, Entry { object });
        if did.0 >= self.highest_did.load(Ordering::Relaxed) {
            self.highest_did.store(did.0, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn uninstall(&self, did: Did) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(&did.0).ok_or(ErrorKind::NoSuchResource)?;
        if did.0 < self.next_lowest_did.load(Ordering::Relaxed) {
            self.next_lowest_did.store(did.0, Ordering::Relaxed);
        }
        if did.0 >= self.highest_did.load(Ordering::Relaxed) {
            let new_highest = entries.keys().next_back().copied().unwrap_or(0);
            self.highest_did.store(new_highest, Ordering::Relaxed);
        }
        let _ = entry.object.release();
        Ok(())
    }

    /// Look up `did`, optionally retaining the returned object so a
    /// concurrent `uninstall` cannot invalidate it out from under the
    /// caller (spec.md §4.6).
    pub fn lookup(&self, did: Did, retain: bool) -> KernelResult<Arc<dyn DescriptorObject>> {
        let entries = self.entries.lock();
        let entry = entries.get(&did.0).ok_or(ErrorKind::NoSuchResource)?;
        if retain {
            entry.object.retain();
        }
        Ok(entry.object.clone())
    }

    /// The largest DID currently in use, or 0 if the table is empty
    /// (spec.md §3: "`highest_did` is the largest in use").
    pub fn highest_did(&self) -> u64 {
        self.highest_did.load(Ordering::Relaxed)
    }

    /// Release every installed descriptor, used when a process is torn
    /// down.
    pub fn uninstall_all(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.iter() {
            let _ = entry.object.release();
        }
        entries.clear();
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

fn find_next_gap(entries: &BTreeMap<u64, Entry>, mut from: u64) -> u64 {
    while entries.contains_key(&from) {
        from += 1;
    }
    from
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counted(core::sync::atomic::AtomicU64);

    impl DescriptorObject for Counted {
        fn retain(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn release(&self) -> KernelResult<()> {
            self.0.fetch_sub(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn install_assigns_smallest_free_did() {
        let table = DescriptorTable::new();
        let a = table.install(Arc::new(Counted(AtomicU64::new(1))));
        let b = table.install(Arc::new(Counted(AtomicU64::new(1))));
        assert_eq!(a, Did(0));
        assert_eq!(b, Did(1));
        table.uninstall(a).unwrap();
        let c = table.install(Arc::new(Counted(AtomicU64::new(1))));
        assert_eq!(c, Did(0));
    }

    #[test]
    fn uninstall_unknown_did_is_no_such_resource() {
        let table = DescriptorTable::new();
        assert_eq!(table.uninstall(Did(4)), Err(ErrorKind::NoSuchResource));
    }

    #[test]
    fn install_at_occupied_slot_fails() {
        let table = DescriptorTable::new();
        table.install_at(Did(5), Arc::new(Counted(AtomicU64::new(1)))).unwrap();
        assert_eq!(
            table.install_at(Did(5), Arc::new(Counted(AtomicU64::new(1)))),
            Err(ErrorKind::AlreadyInProgress)
        );
    }

    #[test]
    fn uninstalling_the_highest_did_recomputes_it() {
        let table = DescriptorTable::new();
        let a = table.install(Arc::new(Counted(AtomicU64::new(1))));
        let b = table.install(Arc::new(Counted(AtomicU64::new(1))));
        assert_eq!(table.highest_did(), b.0);

        table.uninstall(b).unwrap();
        assert_eq!(table.highest_did(), a.0);

        table.uninstall(a).unwrap();
        assert_eq!(table.highest_did(), 0);
    }

    #[test]
    fn lookup_with_retain_bumps_the_objects_refcount() {
        let table = DescriptorTable::new();
        let counter = Arc::new(Counted(AtomicU64::new(1)));
        let did = table.install(counter.clone());
        table.lookup(did, true).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 2);
    }
}
