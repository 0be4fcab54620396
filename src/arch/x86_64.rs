//! x86_64 page tables, interrupt masking, and TLB shootdown plumbing.
//!
//! Page tables are walked through the classic recursive self-mapping trick:
//! one PML4 slot ([`RECURSIVE_INDEX`]) points back at the PML4 itself, so
//! every table at every level is reachable through a fixed virtual address
//! pattern without ever needing a temporary mapping to edit it (spec.md
//! §4.2).

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{PageFlags, PageTableOps};
use crate::error::{ErrorKind, KernelResult};

/// PML4 slot devoted to the recursive mapping.
const RECURSIVE_INDEX: u64 = 510;
const ENTRIES: usize = 512;

#[repr(transparent)]
#[derive(Clone, Copy)]
struct Entry(u64);

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const NO_EXECUTE: u64 = 1 << 63;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(self) -> bool {
        self.0 & PRESENT != 0
    }

    fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    fn set(&mut self, phys: u64, flags: PageFlags) {
        let mut bits = phys & ADDR_MASK;
        if flags.contains(PageFlags::PRESENT) {
            bits |= PRESENT;
        }
        if flags.contains(PageFlags::WRITABLE) {
            bits |= WRITABLE;
        }
        if flags.contains(PageFlags::USER) {
            bits |= USER;
        }
        if !flags.contains(PageFlags::EXECUTABLE) {
            bits |= NO_EXECUTE;
        }
        self.0 = bits;
    }
}

#[repr(C, align(4096))]
struct Table([Entry; ENTRIES]);

fn sign_extend(addr: u64) -> u64 {
    // Bit 47 determines the sign-extended high bits of a canonical x86_64
    // virtual address; RECURSIVE_INDEX (510) always sets it.
    if addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr
    }
}

fn indices(virt: u64) -> (u64, u64, u64, u64) {
    (
        (virt >> 39) & 0x1FF,
        (virt >> 30) & 0x1FF,
        (virt >> 21) & 0x1FF,
        (virt >> 12) & 0x1FF,
    )
}

fn table_ptr(r: u64, a: u64, b: u64, c: u64) -> *mut Table {
    sign_extend((r << 39) | (a << 30) | (b << 21) | (c << 12)) as *mut Table
}

fn l4_ptr() -> *mut Table {
    table_ptr(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX)
}

fn l3_ptr(l4_index: u64) -> *mut Table {
    table_ptr(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, l4_index)
}

fn l2_ptr(l4_index: u64, l3_index: u64) -> *mut Table {
    table_ptr(RECURSIVE_INDEX, RECURSIVE_INDEX, l4_index, l3_index)
}

fn l1_ptr(l4_index: u64, l3_index: u64, l2_index: u64) -> *mut Table {
    table_ptr(RECURSIVE_INDEX, l4_index, l3_index, l2_index)
}

/// Fetch or allocate the next-level table referenced by `entry`, creating it
/// (via the physical frame allocator) if absent.
///
/// # Safety
/// `table_virt` must currently be a valid, exclusively-accessed mapping of
/// the table that owns `entry`.
unsafe fn next_level(table_virt: *mut Table, index: usize, user: bool) -> KernelResult<u64> {
    // SAFETY: caller guarantees `table_virt` is valid and exclusively owned.
    let table = unsafe { &mut *table_virt };
    let entry = &mut table.0[index];
    if entry.is_present() {
        return Ok(entry.addr());
    }
    let frame = crate::mm::frame_allocator::global()
        .allocate(1, 0)
        .map_err(|_| ErrorKind::TemporaryOutage)?;
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if user {
        flags |= PageFlags::USER;
    }
    entry.set(frame.as_u64(), flags);
    Ok(frame.as_u64())
}

pub struct X86_64;

/// Architecture-neutral alias used by `mm::page_table`.
pub type Impl = X86_64;

impl PageTableOps for X86_64 {
    fn new_root() -> KernelResult<u64> {
        let frame = crate::mm::frame_allocator::global()
            .allocate(1, 0)
            .map_err(|_| ErrorKind::TemporaryOutage)?;
        // SAFETY: `frame` was just allocated and is not mapped or aliased
        // anywhere else yet; we access it through the identity window the
        // frame allocator guarantees for freshly allocated frames below 4G,
        // matching the teacher's `phys_to_virt_addr` convention.
        let table = unsafe { &mut *(crate::mm::phys_to_virt(frame.as_u64()) as *mut Table) };
        for entry in table.0.iter_mut() {
            *entry = Entry::empty();
        }
        // Recursive slot: points at itself.
        table.0[RECURSIVE_INDEX as usize].set(frame.as_u64(), PageFlags::PRESENT | PageFlags::WRITABLE);
        Ok(frame.as_u64())
    }

    unsafe fn map_page(root: u64, virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
        if virt % 4096 != 0 || phys % 4096 != 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        let (i4, i3, i2, i1) = indices(virt);
        let user = flags.contains(PageFlags::USER);
        Self::activate(root);
        // SAFETY: the recursive mapping for `root` is active for the
        // duration of this call (see `WITH_ROOT` below), so the table
        // pointers computed from the fixed recursive addresses are valid.
        unsafe {
            next_level(l4_ptr(), i4 as usize, user)?;
            next_level(l3_ptr(i4), i3 as usize, user)?;
            next_level(l2_ptr(i4, i3), i2 as usize, user)?;
            let l1 = &mut *l1_ptr(i4, i3, i2);
            l1.0[i1 as usize].set(phys, flags);
        }
        X86_64::flush_address(virt);
        Ok(())
    }

    unsafe fn unmap_page(root: u64, virt: u64) -> KernelResult<()> {
        let (i4, i3, i2, i1) = indices(virt);
        Self::activate(root);
        // SAFETY: see `map_page`.
        unsafe {
            let l1 = &mut *l1_ptr(i4, i3, i2);
            if !l1.0[i1 as usize].is_present() {
                return Err(ErrorKind::NoSuchResource);
            }
            l1.0[i1 as usize] = Entry::empty();
        }
        X86_64::flush_address(virt);
        Ok(())
    }

    unsafe fn translate(root: u64, virt: u64) -> Option<u64> {
        let (i4, i3, i2, i1) = indices(virt);
        Self::activate(root);
        // SAFETY: see `map_page`.
        unsafe {
            if !(*l4_ptr()).0[i4 as usize].is_present() {
                return None;
            }
            if !(*l3_ptr(i4)).0[i3 as usize].is_present() {
                return None;
            }
            if !(*l2_ptr(i4, i3)).0[i2 as usize].is_present() {
                return None;
            }
            let entry = (*l1_ptr(i4, i3, i2)).0[i1 as usize];
            entry.is_present().then(|| entry.addr() | (virt & 0xFFF))
        }
    }

    fn flush_address(virt: u64) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    }

    fn flush_all() {
        x86_64::instructions::tlb::flush_all();
    }

    fn activate(root: u64) {
        WITH_ROOT.lock().activate_for_edit(root);
    }
}

/// Tracks which root is currently installed via CR3, so repeated edits to
/// the same address space avoid redundant reloads.
struct RootGuard {
    active: u64,
}

impl RootGuard {
    fn activate_for_edit(&mut self, root: u64) {
        if self.active == root {
            return;
        }
        let frame = x86_64::structures::paging::PhysFrame::containing_address(x86_64::PhysAddr::new(root));
        // SAFETY: `root` is a physical address of a page table previously
        // produced by `new_root`, which is the only way callers obtain one.
        unsafe {
            x86_64::registers::control::Cr3::write(frame, x86_64::registers::control::Cr3Flags::empty());
        }
        self.active = root;
    }
}

static WITH_ROOT: Mutex<RootGuard> = Mutex::new(RootGuard { active: 0 });

pub fn halt() {
    x86_64::instructions::hlt();
}

pub fn disable_interrupts() -> bool {
    let was_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    was_enabled
}

pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        x86_64::instructions::interrupts::enable();
    }
}

/// Per-CPU pending shootdown addresses, drained while spinning.
static PENDING_SHOOTDOWNS: Mutex<[Option<u64>; 64]> = Mutex::new([None; 64]);
static MONOTONIC: AtomicU64 = AtomicU64::new(0);

pub fn drain_pending_ipi_work() {
    let mut queue = PENDING_SHOOTDOWNS.lock();
    for slot in queue.iter_mut() {
        if let Some(addr) = slot.take() {
            X86_64::flush_address(addr);
        }
    }
}

pub fn send_shootdown(_cpu_id: usize, virt_addr: u64) {
    let mut queue = PENDING_SHOOTDOWNS.lock();
    if let Some(slot) = queue.iter_mut().find(|s| s.is_none()) {
        *slot = Some(virt_addr);
    }
    // Actual IPI delivery goes through the interrupt controller, an
    // external interface (spec.md §6); this crate only maintains the work
    // item so `drain_pending_ipi_work` has something to act on.
}

pub fn monotonic_ticks() -> u64 {
    MONOTONIC.fetch_add(1, Ordering::Relaxed)
}
