// Memory Management Subsystem
//
// Groups the pieces environments are built from: the physical frame table,
// the 4-level page-table walker and the per-environment address space.
//
// Virtual layout shared by every address space:
//
//   0xFFFF_8000_0000_0000  PHYS_OFFSET   direct window onto physical memory,
//                                        kernel image (PML4 slots 256..512)
//   0x0000_7F80_0000_0000  UTOP / UVPT   read-only self-map (PML4 slot 255)
//   UTOP - 2 pages         USTACKTOP     top of the initial user stack
//   0x0000_0000_0000_0000                user program image
//
// Everything at or above UTOP is either kernel-only or the self-map. The
// user half below it is private to each environment.

pub mod addrspace;
pub mod paging;
pub mod pmm;

pub use pmm::{FrameAllocator, MemoryError, PAGE_SIZE};

/// First PML4 slot of the shared kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// PML4 slot holding each environment's self-map.
pub const SELF_MAP_SLOT: usize = 255;

/// Bytes covered by one PML4 slot.
const PML4_SLOT_SPAN: u64 = 1 << 39;

/// Split address: everything below is private to an environment.
pub const UTOP: u64 = SELF_MAP_SLOT as u64 * PML4_SLOT_SPAN;

/// Where the self-map exposes the page tables to user mode.
pub const UVPT: u64 = UTOP;

/// Top of the initial user stack. One guard page separates it from UTOP.
pub const USTACKTOP: u64 = UTOP - 2 * PAGE_SIZE as u64;

/// Base of the kernel's direct window onto physical memory.
pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE as u64 - 1) == 0
}
