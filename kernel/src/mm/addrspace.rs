// Environment Address Spaces
//
// An `AddressSpace` is the exclusive owner of one 4-level hierarchy: the top
// level table frame plus every table and page reachable below UTOP.
//
// Key responsibilities:
// - Build a fresh hierarchy that shares the kernel half with every other one
// - Install the read-only self-map at UVPT
// - Map/unmap user pages and answer permission queries over user ranges
// - Tear the private half down and give every frame back
//
// Design principles:
// - The kernel half (PML4 slots 256..512) is copied from the boot root once
//   per environment and never edited afterwards
// - The handle is deliberately not `Clone`; ownership moves with the record
// - Release is explicit because it needs the allocator the frames came from
//
// Correctness and safety notes:
// - The self-map entry is PRESENT|USER without WRITABLE, so user mode can
//   read its page tables but never forge a mapping
// - Teardown only walks slots below SELF_MAP_SLOT; the self-map points back
//   at the root and must not be followed
// - The owner must make sure this root is not active before `release`

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use super::paging::{self, table_mut, MapError};
use super::{align_down, FrameAllocator, MemoryError, KERNEL_PML4_START, PAGE_SIZE, SELF_MAP_SLOT, UTOP};
use crate::arch::Machine;

/// Permission bits every user page gets from the loader.
pub const USER_RW: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// First address in a user range that failed a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadUserAccess {
    pub va: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    /// Allocate a zeroed top-level table, copy in the kernel half of
    /// `kernel_root` and add the self-map. The user half stays empty.
    pub fn build<A: FrameAllocator + ?Sized>(
        frames: &mut A,
        kernel_root: PhysFrame,
    ) -> Result<Self, MemoryError> {
        let root = frames.allocate_frame(true)?;

        // SAFETY: `root` was just allocated and `kernel_root` is the boot
        // hierarchy, which is only read here.
        let (template, table) = unsafe { (table_mut(frames, kernel_root), table_mut(frames, root)) };
        for slot in KERNEL_PML4_START..512 {
            table[slot] = template[slot].clone();
        }
        table[SELF_MAP_SLOT].set_frame(
            root,
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
        );

        Ok(Self { root })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Map `frame` at the page containing `va`. Only the user half may be
    /// edited through this handle.
    pub fn map<A: FrameAllocator + ?Sized>(
        &mut self,
        frames: &mut A,
        frame: PhysFrame,
        va: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        if va.as_u64() >= UTOP {
            return Err(MapError::OutsideUserRange);
        }
        paging::map_page(frames, self.root, va, frame, flags)
    }

    /// Remove the mapping at `va` and drop the address space's reference to
    /// the frame behind it.
    pub fn unmap<M: Machine + ?Sized>(&mut self, machine: &mut M, va: VirtAddr) -> Result<(), MapError> {
        if va.as_u64() >= UTOP {
            return Err(MapError::OutsideUserRange);
        }

        let frame = paging::unmap_page(machine, self.root, va)?;
        if machine.active_root() == self.root {
            machine.flush_page(va);
        }
        machine.release_frame(frame);
        Ok(())
    }

    pub fn translate<A: FrameAllocator + ?Sized>(
        &self,
        frames: &A,
        va: VirtAddr,
    ) -> Option<(PhysFrame, PageTableFlags)> {
        paging::translate(frames, self.root, va)
    }

    /// Check that every page touched by `[va, va + len)` lies below UTOP and
    /// is mapped with at least `perm | PRESENT`.
    pub fn user_mem_check<A: FrameAllocator + ?Sized>(
        &self,
        frames: &A,
        va: u64,
        len: usize,
        perm: PageTableFlags,
    ) -> Result<(), BadUserAccess> {
        if len == 0 {
            return Ok(());
        }

        let end = va.checked_add(len as u64).ok_or(BadUserAccess { va })?;
        let required = perm | PageTableFlags::PRESENT;
        let mut page = align_down(va, PAGE_SIZE as u64);

        while page < end {
            let ok = page < UTOP
                && VirtAddr::try_new(page)
                    .ok()
                    .and_then(|addr| self.translate(frames, addr))
                    .map_or(false, |(_, flags)| flags.contains(required));
            if !ok {
                return Err(BadUserAccess { va: page.max(va) });
            }
            page += PAGE_SIZE as u64;
        }

        Ok(())
    }

    /// Return every user page, every page table under the user half and
    /// finally the top-level table to `frames`. Yields the number of frames
    /// released.
    pub fn release<A: FrameAllocator + ?Sized>(self, frames: &mut A) -> usize {
        let mut released = 0;

        for slot in 0..SELF_MAP_SLOT {
            // SAFETY: the hierarchy is owned by `self`, which is consumed.
            let root = unsafe { table_mut(frames, self.root) };
            let entry = &mut root[slot];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let Ok(pdpt) = entry.frame() else {
                entry.set_unused();
                continue;
            };
            entry.set_unused();

            released += paging::release_subtree(frames, pdpt, 3);
            frames.release_frame(pdpt);
            released += 1;
        }

        frames.release_frame(self.root);
        released + 1
    }
}
