//! Reference-counted, shareable mapping objects composed of portions
//! (spec.md §3, §4.3).

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::error::{ErrorKind, KernelResult};
use crate::mm::frame_allocator::{self, PhysicalFrame};
use crate::sync::Spinlock;

bitflags! {
    /// Flags carried on a [`Mapping`] as a whole (spec.md §3). Distinct
    /// from the per-installation permissions recorded in a `SpaceMapping`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// Pages may be shared copy-on-write rather than duplicated
        /// eagerly when the mapping is reinstalled elsewhere.
        const COPY_ON_WRITE = 1 << 0;
        /// Zero-fill rather than leave uninitialized when first faulted.
        const ZERO_FILL = 1 << 1;
    }
}

/// Where a [`Portion`] gets its physical pages from.
enum Backing {
    /// Owns a contiguous physical run allocated from the frame allocator.
    Allocated { base: PhysicalFrame },
    /// Borrows pages from another mapping, at `page_offset` into it. Does
    /// not own frames; releases the backing mapping on destroy.
    BackingMapping {
        mapping: Arc<Mapping>,
        page_offset: u64,
    },
}

/// One physically contiguous slice of a mapping (spec.md §3, §4.3).
pub struct Portion {
    backing: Backing,
    /// Virtual offset (in pages) within the parent mapping.
    virtual_offset: u64,
    page_count: u64,
    refcount: AtomicU64,
}

impl Portion {
    fn new_allocated(virtual_offset: u64, page_count: u64, base: PhysicalFrame) -> Self {
        Self {
            backing: Backing::Allocated { base },
            virtual_offset,
            page_count,
            refcount: AtomicU64::new(1),
        }
    }

    fn new_backing(virtual_offset: u64, page_count: u64, mapping: Arc<Mapping>, page_offset: u64) -> Self {
        // A backing portion does not own frames, but it does depend on the
        // backing mapping staying alive; hold a reference for as long as
        // this portion exists, released in `Portion::release`.
        mapping.retain();
        Self {
            backing: Backing::BackingMapping { mapping, page_offset },
            virtual_offset,
            page_count,
            refcount: AtomicU64::new(1),
        }
    }

    pub fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Resolve the physical frame backing page `index` (0-based, relative
    /// to this portion), following one level of mapping-to-mapping nesting
    /// (spec.md §4.2: "nesting deeper than one level is flattened at
    /// insert time").
    pub fn resolve(&self, index: u64) -> KernelResult<PhysicalFrame> {
        if index >= self.page_count {
            return Err(ErrorKind::InvalidArgument);
        }
        match &self.backing {
            Backing::Allocated { base } => {
                Ok(PhysicalFrame::new(base.as_u64() + index * frame_allocator::PAGE_SIZE))
            }
            Backing::BackingMapping { mapping, page_offset } => {
                mapping.resolve_page(page_offset + index)
            }
        }
    }

    fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one reference; returns `true` if this was the last one, in
    /// which case owned frames (if any) have already been freed.
    fn release(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        match &self.backing {
            Backing::Allocated { base } => {
                let _ = frame_allocator::global().free(*base, self.page_count);
            }
            Backing::BackingMapping { mapping, .. } => mapping.release(),
        }
        true
    }
}

struct MappingState {
    portions: Vec<Portion>,
    /// Once any portion has been looked up via `resolve_page` from an
    /// installed address space, the portion list is frozen (spec.md
    /// §4.3: "After first activation in any address space, the portion
    /// list is frozen").
    frozen: bool,
}

/// A shareable, reference-counted sequence of virtual pages (spec.md §3,
/// §4.3).
pub struct Mapping {
    page_count: u64,
    flags: MappingFlags,
    refcount: AtomicU64,
    state: Spinlock<MappingState>,
}

impl Mapping {
    /// Create a new, empty mapping of `page_count` pages. Portions are
    /// added with [`insert_portion`](Self::insert_portion) before the
    /// mapping is first shared.
    pub fn new(page_count: u64, flags: MappingFlags) -> KernelResult<Arc<Self>> {
        if page_count == 0 || page_count > u32::MAX as u64 {
            return Err(ErrorKind::InvalidArgument);
        }
        Ok(Arc::new(Self {
            page_count,
            flags,
            refcount: AtomicU64::new(1),
            state: Spinlock::new(MappingState {
                portions: Vec::new(),
                frozen: false,
            }),
        }))
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    /// Allocate `page_count` fresh physical pages and add them as a
    /// portion at `page_offset` within this mapping.
    pub fn insert_allocated_portion(
        &self,
        page_offset: u64,
        page_count: u64,
        alignment_power: u32,
    ) -> KernelResult<()> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(ErrorKind::AlreadyInProgress);
        }
        validate_portion_bounds(&state.portions, page_offset, page_count, self.page_count)?;
        let base = frame_allocator::global().allocate(page_count, alignment_power)?;
        state
            .portions
            .push(Portion::new_allocated(page_offset, page_count, base));
        Ok(())
    }

    /// Add a portion at `page_offset` that borrows `page_count` pages from
    /// `backing`, starting at `backing_page_offset` within it.
    pub fn insert_backing_portion(
        &self,
        page_offset: u64,
        page_count: u64,
        backing: Arc<Mapping>,
        backing_page_offset: u64,
    ) -> KernelResult<()> {
        if backing_page_offset + page_count > backing.page_count {
            return Err(ErrorKind::InvalidArgument);
        }
        let mut state = self.state.lock();
        if state.frozen {
            return Err(ErrorKind::AlreadyInProgress);
        }
        validate_portion_bounds(&state.portions, page_offset, page_count, self.page_count)?;
        state.portions.push(Portion::new_backing(
            page_offset,
            page_count,
            backing,
            backing_page_offset,
        ));
        Ok(())
    }

    /// Resolve the physical frame backing page `index` within this mapping
    /// as a whole, freezing the portion list on first call.
    pub fn resolve_page(&self, index: u64) -> KernelResult<PhysicalFrame> {
        let mut state = self.state.lock();
        state.frozen = true;
        let portion = state
            .portions
            .iter()
            .find(|p| index >= p.virtual_offset && index < p.virtual_offset + p.page_count)
            .ok_or(ErrorKind::InvalidArgument)?;
        portion.resolve(index - portion.virtual_offset)
    }

    /// Increment the mapping refcount. Called when a mapping is installed
    /// into an address space.
    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    /// Release one reference; when this drops the count to zero, every
    /// portion is released in turn (spec.md §4.3).
    pub fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let state = self.state.lock();
            for portion in &state.portions {
                portion.release();
            }
        }
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Adapter letting a [`Mapping`] sit in a process's descriptor table
/// (spec.md §4.6) alongside channels and child processes.
pub struct MappingDescriptor(pub Arc<Mapping>);

impl crate::process::descriptor::DescriptorObject for MappingDescriptor {
    fn retain(&self) {
        self.0.retain();
    }

    fn release(&self) -> KernelResult<()> {
        self.0.release();
        Ok(())
    }
}

fn validate_portion_bounds(
    existing: &[Portion],
    page_offset: u64,
    page_count: u64,
    mapping_page_count: u64,
) -> KernelResult<()> {
    if page_count == 0 || page_offset + page_count > mapping_page_count {
        return Err(ErrorKind::InvalidArgument);
    }
    // Portions must be strictly increasing and non-overlapping (spec.md
    // §3); since portions are only ever appended, checking against the
    // last one suffices.
    if let Some(last) = existing.last() {
        if page_offset < last.virtual_offset + last.page_count {
            return Err(ErrorKind::AlreadyInProgress);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_portion_resolves_contiguous_frames() {
        frame_allocator::global().register_region(100 * frame_allocator::PAGE_SIZE, 16);
        let mapping = Mapping::new(4, MappingFlags::empty()).unwrap();
        mapping.insert_allocated_portion(0, 4, 0).unwrap();
        let first = mapping.resolve_page(0).unwrap();
        let second = mapping.resolve_page(1).unwrap();
        assert_eq!(
            second.as_u64() - first.as_u64(),
            frame_allocator::PAGE_SIZE
        );
    }

    #[test]
    fn overlapping_portions_are_rejected() {
        frame_allocator::global().register_region(1000 * frame_allocator::PAGE_SIZE, 16);
        let mapping = Mapping::new(8, MappingFlags::empty()).unwrap();
        mapping.insert_allocated_portion(0, 4, 0).unwrap();
        assert_eq!(
            mapping.insert_allocated_portion(2, 4, 0),
            Err(ErrorKind::AlreadyInProgress)
        );
    }

    #[test]
    fn backing_portion_resolves_through_parent() {
        frame_allocator::global().register_region(2000 * frame_allocator::PAGE_SIZE, 16);
        let parent = Mapping::new(4, MappingFlags::empty()).unwrap();
        parent.insert_allocated_portion(0, 4, 0).unwrap();
        let child = Mapping::new(4, MappingFlags::empty()).unwrap();
        child
            .insert_backing_portion(0, 4, parent.clone(), 0)
            .unwrap();
        assert_eq!(
            child.resolve_page(2).unwrap(),
            parent.resolve_page(2).unwrap()
        );
    }

    #[test]
    fn a_backing_portion_holds_its_parent_alive_until_the_child_releases() {
        frame_allocator::global().register_region(2100 * frame_allocator::PAGE_SIZE, 16);
        let parent = Mapping::new(4, MappingFlags::empty()).unwrap();
        parent.insert_allocated_portion(0, 4, 0).unwrap();
        let child = Mapping::new(4, MappingFlags::empty()).unwrap();
        child
            .insert_backing_portion(0, 4, parent.clone(), 0)
            .unwrap();
        // The child's backing portion took out its own reference on top of
        // the caller's `parent` handle.
        assert_eq!(parent.refcount(), 2);

        // Dropping the child releases the portion, which releases the
        // parent's reference in turn -- the parent is still alive here only
        // because this test also still holds `parent` directly.
        child.release();
        assert_eq!(parent.refcount(), 1);
    }
}
