//! Per-process virtual address space (spec.md §4.2): a reservation-backed
//! virtual allocator, the list of mappings currently installed over it, and
//! the page-table/TLB plumbing tying both to a concrete
//! [`crate::arch::PageTableOps`] backend.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::PageFlags;
use crate::error::{ErrorKind, KernelResult};
use crate::mm::frame_allocator::PAGE_SIZE;
use crate::mm::mapping::Mapping;
use crate::mm::page_table::PageTable;
use crate::mm::tlb::ActiveCpuSet;
use crate::sync::Spinlock;

/// A contiguous run of virtual pages, free or reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    base: u64,
    page_count: u64,
}

impl Block {
    fn end(&self) -> u64 {
        self.base + self.page_count * PAGE_SIZE
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

fn ranges_overlap(a_base: u64, a_count: u64, b_base: u64, b_count: u64) -> bool {
    let a_end = a_base + a_count * PAGE_SIZE;
    let b_end = b_base + b_count * PAGE_SIZE;
    a_base < b_end && b_base < a_end
}

/// The per-space sorted free-list virtual allocator (spec.md §4.2: "design
/// permits an alternative address-ordered tree; either must preserve the
/// guarantee that adjacent free blocks coalesce on free and that allocation
/// picks the lowest-address block meeting size + alignment").
struct VirtualAllocator {
    /// Sorted, non-overlapping, coalesced free ranges.
    free: Vec<Block>,
    /// Bare reservations made by `allocate`, restored to `free` by `free`.
    reserved: Vec<Block>,
}

impl VirtualAllocator {
    fn new(base: u64, page_count: u64) -> Self {
        Self {
            free: alloc::vec![Block { base, page_count }],
            reserved: Vec::new(),
        }
    }

    /// Carve `page_count` pages aligned to `1 << alignment_power` out of the
    /// lowest-address free block that fits, without recording them anywhere
    /// else. Caller decides whether to track the carved range.
    fn carve_lowest_fit(&mut self, page_count: u64, alignment_power: u32) -> KernelResult<u64> {
        let alignment = 1u64
            .checked_shl(alignment_power)
            .ok_or(ErrorKind::InvalidArgument)?;
        let (index, base) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(i, block)| {
                let aligned = align_up(block.base, alignment);
                (aligned + page_count * PAGE_SIZE <= block.end()).then_some((i, aligned))
            })
            .ok_or(ErrorKind::TemporaryOutage)?;
        self.split_out(index, base, page_count);
        Ok(base)
    }

    /// Carve exactly `[base, base + page_count)` out of the free list,
    /// failing if that range is not entirely free.
    fn carve_exact(&mut self, base: u64, page_count: u64) -> KernelResult<()> {
        let index = self
            .free
            .iter()
            .position(|block| block.base <= base && base + page_count * PAGE_SIZE <= block.end())
            .ok_or(ErrorKind::TemporaryOutage)?;
        self.split_out(index, base, page_count);
        Ok(())
    }

    fn split_out(&mut self, index: usize, base: u64, page_count: u64) {
        let block = self.free.remove(index);
        let carved_end = base + page_count * PAGE_SIZE;
        if block.base < base {
            self.free.insert(
                index,
                Block {
                    base: block.base,
                    page_count: (base - block.base) / PAGE_SIZE,
                },
            );
        }
        if carved_end < block.end() {
            let pos = self.free.iter().position(|b| b.base > carved_end).unwrap_or(self.free.len());
            self.free.insert(
                pos,
                Block {
                    base: carved_end,
                    page_count: (block.end() - carved_end) / PAGE_SIZE,
                },
            );
        }
    }

    /// Return `[base, base + page_count)` to the free list, coalescing with
    /// any adjacent free neighbors.
    fn release(&mut self, mut base: u64, mut page_count: u64) {
        if let Some(i) = self.free.iter().position(|b| b.end() == base) {
            let left = self.free.remove(i);
            base = left.base;
            page_count += left.page_count;
        }
        let end = base + page_count * PAGE_SIZE;
        if let Some(i) = self.free.iter().position(|b| b.base == end) {
            let right = self.free.remove(i);
            page_count += right.page_count;
        }
        let pos = self.free.iter().position(|b| b.base > base).unwrap_or(self.free.len());
        self.free.insert(pos, Block { base, page_count });
    }

    fn allocate(&mut self, page_count: u64, alignment_power: u32) -> KernelResult<u64> {
        if page_count == 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        let base = self.carve_lowest_fit(page_count, alignment_power)?;
        self.reserved.push(Block { base, page_count });
        Ok(base)
    }

    fn free(&mut self, virt_addr: u64) -> KernelResult<()> {
        let index = self
            .reserved
            .iter()
            .position(|b| b.base == virt_addr)
            .ok_or(ErrorKind::NoSuchResource)?;
        let block = self.reserved.remove(index);
        self.release(block.base, block.page_count);
        Ok(())
    }
}

/// One mapping installed into an address space: the virtual range
/// `[virt_addr, virt_addr + page_count * PAGE_SIZE)` is backed by `mapping`
/// starting at `mapping_offset` pages into it.
struct Installed {
    virt_addr: u64,
    page_count: u64,
    mapping: Arc<Mapping>,
    mapping_offset: u64,
    perms: PageFlags,
}

struct State {
    virt: VirtualAllocator,
    installed: Vec<Installed>,
}

/// A process's (or the kernel's) virtual address space.
pub struct AddressSpace {
    page_table: PageTable,
    state: Spinlock<State>,
    active_cpus: ActiveCpuSet,
}

impl AddressSpace {
    /// Create a new space managing `[virt_base, virt_base + page_count *
    /// PAGE_SIZE)`.
    pub fn new(virt_base: u64, page_count: u64) -> KernelResult<Self> {
        if page_count == 0 || virt_base % PAGE_SIZE != 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        Ok(Self {
            page_table: PageTable::new()?,
            state: Spinlock::new(State {
                virt: VirtualAllocator::new(virt_base, page_count),
                installed: Vec::new(),
            }),
            active_cpus: ActiveCpuSet::new(),
        })
    }

    /// Reserve `page_count` virtual pages without installing any backing.
    pub fn allocate_virtual(&self, page_count: u64, alignment_power: u32) -> KernelResult<u64> {
        self.state.lock().virt.allocate(page_count, alignment_power)
    }

    /// Release a prior reservation made by `allocate_virtual`. Fails if
    /// `virt_addr` is not the base of an outstanding reservation, or if a
    /// mapping has since been installed over it.
    pub fn free_virtual(&self, virt_addr: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        if state.installed.iter().any(|m| m.virt_addr == virt_addr) {
            return Err(ErrorKind::InvalidArgument);
        }
        state.virt.free(virt_addr)
    }

    /// Install `mapping`'s pages `[page_offset, page_offset + page_count)`
    /// into this space, at `hint_virt_addr` if given and free, otherwise at
    /// the lowest free address that fits. Returns the address chosen.
    pub fn insert_mapping(
        &self,
        mapping: Arc<Mapping>,
        page_offset: u64,
        page_count: u64,
        hint_virt_addr: Option<u64>,
        perms: PageFlags,
    ) -> KernelResult<u64> {
        if page_count == 0 || page_offset + page_count > mapping.page_count() {
            return Err(ErrorKind::InvalidArgument);
        }
        let mut state = self.state.lock();
        let virt_addr = match hint_virt_addr {
            Some(addr) if addr % PAGE_SIZE == 0 => {
                // A hint landing on an already-installed mapping is a
                // retry of a prior insert, not a fresh allocation failure
                // (spec.md §8 S4): report it as such rather than the
                // generic exhaustion error `carve_exact` would give.
                if state.installed.iter().any(|m| ranges_overlap(m.virt_addr, m.page_count, addr, page_count)) {
                    return Err(ErrorKind::AlreadyInProgress);
                }
                state.virt.carve_exact(addr, page_count)?;
                addr
            }
            Some(_) => return Err(ErrorKind::InvalidArgument),
            None => state.virt.carve_lowest_fit(page_count, 0)?,
        };

        let retained = mapping.retain();
        for i in 0..page_count {
            let result = retained
                .resolve_page(page_offset + i)
                .and_then(|frame| {
                    // SAFETY: `state` is locked for the duration of this
                    // call, serializing every other edit to this table.
                    unsafe { self.page_table.map(virt_addr + i * PAGE_SIZE, frame.as_u64(), perms) }
                });
            if let Err(err) = result {
                for j in 0..i {
                    // SAFETY: see above; undoing a partial install.
                    let _ = unsafe { self.page_table.unmap(virt_addr + j * PAGE_SIZE) };
                }
                state.virt.release(virt_addr, page_count);
                retained.release();
                return Err(err);
            }
        }

        state.installed.push(Installed {
            virt_addr,
            page_count,
            mapping: retained,
            mapping_offset: page_offset,
            perms,
        });
        Ok(virt_addr)
    }

    /// Detach the mapping installed at `virt_addr`, unmap its pages, and
    /// release the space's reference on it.
    pub fn remove_mapping(&self, virt_addr: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        let index = state
            .installed
            .iter()
            .position(|m| m.virt_addr == virt_addr)
            .ok_or(ErrorKind::NoSuchResource)?;
        let installed = state.installed.remove(index);
        for i in 0..installed.page_count {
            let addr = installed.virt_addr + i * PAGE_SIZE;
            // SAFETY: `state` is locked, serializing table edits.
            unsafe {
                let _ = self.page_table.unmap(addr);
            }
            self.active_cpus.shootdown(addr);
        }
        installed.mapping.release();
        state.virt.release(installed.virt_addr, installed.page_count);
        Ok(())
    }

    /// Resolve `virt_addr` to the mapping backing it, the page offset into
    /// that mapping, and the permissions it was installed with.
    pub fn lookup(&self, virt_addr: u64) -> KernelResult<(Arc<Mapping>, u64, PageFlags)> {
        let state = self.state.lock();
        let entry = state
            .installed
            .iter()
            .find(|m| ranges_overlap(m.virt_addr, m.page_count, virt_addr, 1))
            .ok_or(ErrorKind::NoSuchResource)?;
        let page_index = (virt_addr - entry.virt_addr) / PAGE_SIZE;
        Ok((entry.mapping.clone(), entry.mapping_offset + page_index, entry.perms))
    }

    /// Install this space's page table as the one the local CPU's MMU
    /// walks, and record `cpu_id` as sharing it for future shootdowns.
    pub fn activate(&self, cpu_id: usize) {
        self.page_table.activate();
        self.active_cpus.mark_active(cpu_id);
    }

    /// Stop counting `cpu_id` as sharing this space. Does not itself switch
    /// the CPU to another table; the caller is expected to `activate` the
    /// next space immediately after.
    pub fn deactivate(&self, cpu_id: usize) {
        self.active_cpus.mark_inactive(cpu_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_virtual_picks_lowest_address_and_free_virtual_restores_it() {
        let mut virt = VirtualAllocator::new(0x1000_0000, 16);
        let first = virt.allocate(4, 0).unwrap();
        let second = virt.allocate(4, 0).unwrap();
        assert_eq!(first, 0x1000_0000);
        assert_eq!(second, 0x1000_0000 + 4 * PAGE_SIZE);

        virt.free(first).unwrap();
        let reused = virt.allocate(4, 0).unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn freeing_an_unknown_reservation_is_no_such_resource() {
        let mut virt = VirtualAllocator::new(0x2000_0000, 8);
        assert_eq!(virt.free(0x2000_0000), Err(ErrorKind::NoSuchResource));
    }

    #[test]
    fn alignment_is_honored_even_when_it_skips_a_smaller_free_gap() {
        let mut virt = VirtualAllocator::new(0, 32);
        // Carve out a one-page hole right after the start so the remaining
        // free block begins unaligned for a 4-page (alignment_power=2)
        // request.
        virt.allocate(1, 0).unwrap();
        let aligned = virt.allocate(4, 2).unwrap();
        assert_eq!(aligned % (4 * PAGE_SIZE), 0);
    }

    #[test]
    fn exhausted_range_returns_temporary_outage() {
        let mut virt = VirtualAllocator::new(0, 4);
        assert_eq!(virt.allocate(8, 0), Err(ErrorKind::TemporaryOutage));
    }

    #[test]
    fn adjacent_frees_coalesce_into_a_single_block() {
        let mut virt = VirtualAllocator::new(0, 16);
        let a = virt.allocate(4, 0).unwrap();
        let b = virt.allocate(4, 0).unwrap();
        virt.free(a).unwrap();
        virt.free(b).unwrap();
        assert_eq!(virt.free.len(), 1);
        assert_eq!(virt.free[0], Block { base: 0, page_count: 16 });
    }
}
