// Physical Memory Manager (PMM)
//
// Reference-counted physical frame table plus the `FrameAllocator` contract
// the environment core is written against.
//
// Key responsibilities:
// - Parse the UEFI memory map to discover usable physical memory
// - Hand out single 4 KiB frames, zero-filled on request
// - Reclaim a frame once its last reference is released
// - Expose free-frame counts for diagnostics and tests
//
// Implementation details:
// - One byte per frame: 0 = free, 0xFF = reserved/untracked, otherwise the
//   number of live references
// - The table starts "all reserved"; only EFI_CONVENTIONAL_MEMORY is freed
// - Physical page 0 is never handed out so a zero frame always means a bug
// - A next-fit hint keeps sequential allocations cheap
//
// Correctness notes:
// - Releasing a free or reserved frame is logged and ignored
// - Zeroing goes through `frame_ptr`, the kernel's window onto the frame

use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::boot::MemoryMap;
use crate::{log_info, log_warn};

pub const PAGE_SIZE: usize = 4096;

/// Frames the direct window can reach (512 MiB).
pub const MAX_PHYS_PAGES: usize = 128 * 1024;

const RESERVED: u8 = u8::MAX;

const LOG_ORIGIN: &str = "pmm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfMemory,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfMemory => f.write_str("out of physical memory"),
        }
    }
}

/// Source of physical frames for page tables and user memory.
pub trait FrameAllocator {
    /// Take one frame with a reference count of one. When `zero` is false
    /// the contents are whatever the previous owner left behind.
    fn allocate_frame(&mut self, zero: bool) -> Result<PhysFrame, MemoryError>;

    /// Drop one reference; the frame returns to the pool at zero.
    fn release_frame(&mut self, frame: PhysFrame);

    /// Kernel-visible pointer to the first byte of `frame`.
    fn frame_ptr(&self, frame: PhysFrame) -> *mut u8;

    fn free_frames(&self) -> usize;
}

pub struct FrameTable<const PAGES: usize> {
    refs: [u8; PAGES],
    total: usize,
    free: usize,
    hint: usize,
}

impl<const PAGES: usize> FrameTable<PAGES> {
    pub const fn new() -> Self {
        Self {
            refs: [RESERVED; PAGES],
            total: 0,
            free: 0,
            hint: 0,
        }
    }

    /// Mark `pages` frames starting at `start` as usable. Frames beyond the
    /// table and page 0 stay reserved.
    pub fn add_free_range(&mut self, start: PhysAddr, pages: usize) {
        let first = (start.align_up(PAGE_SIZE as u64).as_u64() as usize) / PAGE_SIZE;
        let end = first.saturating_add(pages).min(PAGES);

        for page in first.max(1)..end {
            if self.refs[page] == RESERVED {
                self.refs[page] = 0;
                self.free += 1;
                self.total += 1;
            }
        }
    }

    pub fn add_memory_map(&mut self, memory_map: &MemoryMap) {
        for desc in memory_map.descriptors().filter(|d| d.is_usable()) {
            self.add_free_range(
                PhysAddr::new(desc.physical_start),
                desc.number_of_pages as usize,
            );
        }

        log_info!(
            LOG_ORIGIN,
            "Frame table ready: tracked={} free={} ({} KiB)",
            self.total,
            self.free,
            self.free * PAGE_SIZE / 1024
        );
    }

    pub fn alloc(&mut self) -> Option<PhysFrame> {
        if self.free == 0 {
            return None;
        }

        for step in 0..PAGES {
            let page = (self.hint + step) % PAGES;
            if self.refs[page] == 0 {
                self.refs[page] = 1;
                self.free -= 1;
                self.hint = page + 1;
                return Some(Self::frame_of(page));
            }
        }
        None
    }

    pub fn release(&mut self, frame: PhysFrame) {
        let page = (frame.start_address().as_u64() as usize) / PAGE_SIZE;
        match self.refs.get(page).copied() {
            None | Some(0) | Some(RESERVED) => {
                log_warn!(
                    LOG_ORIGIN,
                    "Ignoring release of untracked or free frame {:#x}",
                    frame.start_address().as_u64()
                );
            }
            Some(count) => {
                self.refs[page] = count - 1;
                if count == 1 {
                    self.free += 1;
                }
            }
        }
    }

    pub fn free(&self) -> usize {
        self.free
    }

    fn frame_of(page: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((page * PAGE_SIZE) as u64))
    }
}
