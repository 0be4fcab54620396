//! TLB coherence (spec.md §4.2): a per-address-space epoch plus the IPI
//! shootdown plumbing that [`crate::arch`] exposes. Draining happens on
//! the target CPU during spinlock acquisition ([`crate::sync::spinlock`]);
//! this module only decides *when* to enqueue a shootdown.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::Spinlock;

/// Tracks which CPUs currently have a given address space active, so a
/// table edit only needs to shoot down peers that actually share it.
#[derive(Default)]
pub struct ActiveCpuSet {
    cpus: Spinlock<Vec<usize>>,
    epoch: AtomicU64,
}

impl ActiveCpuSet {
    pub const fn new() -> Self {
        Self {
            cpus: Spinlock::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn mark_active(&self, cpu_id: usize) {
        let mut cpus = self.cpus.lock();
        if !cpus.contains(&cpu_id) {
            cpus.push(cpu_id);
        }
    }

    pub fn mark_inactive(&self, cpu_id: usize) {
        self.cpus.lock().retain(|&c| c != cpu_id);
    }

    /// Enqueue a shootdown for `virt_addr` on every CPU currently active in
    /// this address space, and bump the epoch so `activate` callers can
    /// detect they raced a concurrent edit.
    pub fn shootdown(&self, virt_addr: u64) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for &cpu in self.cpus.lock().iter() {
            crate::arch::send_shootdown(cpu, virt_addr);
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_active_is_idempotent() {
        let set = ActiveCpuSet::new();
        set.mark_active(0);
        set.mark_active(0);
        assert_eq!(set.cpus.lock().len(), 1);
    }

    #[test]
    fn shootdown_bumps_epoch() {
        let set = ActiveCpuSet::new();
        let before = set.epoch();
        set.shootdown(0x1000);
        assert_eq!(set.epoch(), before + 1);
    }
}
