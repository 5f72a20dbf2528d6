// Bare-metal x86_64 machine: the global frame table reached through the
// higher-half direct window, plus CR2/CR3 and IF access.

use x86_64::instructions::{interrupts, tlb};
use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::Cpu;
use crate::boot::MemoryMap;
use crate::mm::pmm::{FrameTable, MAX_PHYS_PAGES};
use crate::mm::{FrameAllocator, MemoryError, PAGE_SIZE, PHYS_OFFSET};

pub struct X86Machine {
    frames: FrameTable<MAX_PHYS_PAGES>,
}

impl X86Machine {
    pub const fn new() -> Self {
        Self {
            frames: FrameTable::new(),
        }
    }

    pub fn add_memory_map(&mut self, memory_map: &MemoryMap) {
        self.frames.add_memory_map(memory_map);
    }
}

impl FrameAllocator for X86Machine {
    fn allocate_frame(&mut self, zero: bool) -> Result<PhysFrame, MemoryError> {
        let frame = self.frames.alloc().ok_or(MemoryError::OutOfMemory)?;
        if zero {
            // SAFETY: the frame was just taken from the pool and lies inside
            // the direct window.
            unsafe { core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE) };
        }
        Ok(frame)
    }

    fn release_frame(&mut self, frame: PhysFrame) {
        self.frames.release(frame);
    }

    fn frame_ptr(&self, frame: PhysFrame) -> *mut u8 {
        (PHYS_OFFSET + frame.start_address().as_u64()) as *mut u8
    }

    fn free_frames(&self) -> usize {
        self.frames.free()
    }
}

impl Cpu for X86Machine {
    fn active_root(&self) -> PhysFrame {
        Cr3::read().0
    }

    unsafe fn switch_root(&mut self, root: PhysFrame) {
        Cr3::write(root, Cr3Flags::empty());
    }

    fn flush_page(&mut self, va: VirtAddr) {
        tlb::flush(va);
    }

    fn fault_address(&self) -> VirtAddr {
        VirtAddr::new_truncate(Cr2::read_raw())
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    unsafe fn copy_to_active(&mut self, dst: VirtAddr, src: &[u8]) {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len());
    }

    unsafe fn zero_active(&mut self, dst: VirtAddr, len: usize) {
        core::ptr::write_bytes(dst.as_mut_ptr::<u8>(), 0, len);
    }

    unsafe fn copy_from_active(&self, src: VirtAddr, dst: &mut [u8]) {
        core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
    }
}
