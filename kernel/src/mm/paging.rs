// Page-Table Walker
//
// 4-level (PML4 → PDPT → PD → PT) mapping primitives over an explicit root
// frame. Nothing here looks at CR3: callers name the hierarchy they mean and
// decide themselves whether a TLB flush is needed.
//
// Key responsibilities:
// - Map a single 4 KiB page, creating intermediate tables on demand
// - Unmap and translate single pages
// - Tear down a subtree, returning every frame it references
//
// Implementation details:
// - Tables are reached through `FrameAllocator::frame_ptr`, the kernel's
//   window onto physical memory
// - Intermediate tables are allocated zeroed with P|W|U; the leaf entry alone
//   decides what user mode may do
// - Huge pages are never created and are treated as a mapping conflict
//
// Correctness notes:
// - A walk holds at most one `&mut PageTable` at a time
// - Remapping an occupied slot is an error, never a silent overwrite

use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::VirtAddr;

use super::pmm::FrameAllocator;

/// Flags for intermediate tables.
pub const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfMemory,
    AlreadyMapped,
    NotMapped,
    OutsideUserRange,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::OutOfMemory => f.write_str("out of memory for page tables"),
            MapError::AlreadyMapped => f.write_str("page already mapped"),
            MapError::NotMapped => f.write_str("page not mapped"),
            MapError::OutsideUserRange => f.write_str("address outside the user half"),
        }
    }
}

/// # Safety
///
/// `frame` must hold a page table, and no other reference to it may be live
/// while the returned one is used.
pub(crate) unsafe fn table_mut<'a, A: FrameAllocator + ?Sized>(
    frames: &A,
    frame: PhysFrame,
) -> &'a mut PageTable {
    &mut *(frames.frame_ptr(frame) as *mut PageTable)
}

fn indices(va: VirtAddr) -> [usize; 4] {
    [
        usize::from(va.p4_index()),
        usize::from(va.p3_index()),
        usize::from(va.p2_index()),
        usize::from(va.p1_index()),
    ]
}

fn ensure_table<A: FrameAllocator + ?Sized>(
    frames: &mut A,
    entry: &mut PageTableEntry,
    create: bool,
) -> Result<PhysFrame, MapError> {
    if entry.is_unused() {
        if !create {
            return Err(MapError::NotMapped);
        }
        let table = frames
            .allocate_frame(true)
            .map_err(|_| MapError::OutOfMemory)?;
        entry.set_frame(table, TABLE_FLAGS);
        return Ok(table);
    }

    entry.frame().map_err(|_| MapError::AlreadyMapped)
}

fn walk_to_entry<'a, A: FrameAllocator + ?Sized>(
    frames: &mut A,
    root: PhysFrame,
    va: VirtAddr,
    create: bool,
) -> Result<&'a mut PageTableEntry, MapError> {
    let [p4, p3, p2, p1] = indices(va);
    let mut table_frame = root;

    for index in [p4, p3, p2] {
        // SAFETY: `table_frame` is the root or was installed as a table by
        // this module; the borrow ends before the next level is taken.
        let table = unsafe { table_mut(frames, table_frame) };
        table_frame = ensure_table(frames, &mut table[index], create)?;
    }

    // SAFETY: as above, `table_frame` is now a leaf table.
    let leaf = unsafe { table_mut(frames, table_frame) };
    Ok(&mut leaf[p1])
}

/// Map the page containing `va` to `frame` with `flags | PRESENT`.
pub fn map_page<A: FrameAllocator + ?Sized>(
    frames: &mut A,
    root: PhysFrame,
    va: VirtAddr,
    frame: PhysFrame,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    let entry = walk_to_entry(frames, root, va, true)?;
    if !entry.is_unused() {
        return Err(MapError::AlreadyMapped);
    }

    entry.set_frame(frame, flags | PageTableFlags::PRESENT);
    Ok(())
}

/// Clear the leaf entry for `va` and hand back the frame it pointed at.
pub fn unmap_page<A: FrameAllocator + ?Sized>(
    frames: &mut A,
    root: PhysFrame,
    va: VirtAddr,
) -> Result<PhysFrame, MapError> {
    let entry = walk_to_entry(frames, root, va, false)?;
    let frame = entry.frame().map_err(|_| MapError::NotMapped)?;
    entry.set_unused();
    Ok(frame)
}

/// Leaf frame and flags for `va`, if mapped.
pub fn translate<A: FrameAllocator + ?Sized>(
    frames: &A,
    root: PhysFrame,
    va: VirtAddr,
) -> Option<(PhysFrame, PageTableFlags)> {
    let [p4, p3, p2, p1] = indices(va);
    let mut table_frame = root;

    for index in [p4, p3, p2] {
        // SAFETY: read-only walk over tables installed by this module.
        let table = unsafe { table_mut(frames, table_frame) };
        let entry = &table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        table_frame = entry.frame().ok()?;
    }

    let leaf = &unsafe { table_mut(frames, table_frame) }[p1];
    if !leaf.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some((leaf.frame().ok()?, leaf.flags()))
}

/// Release every frame referenced below `table`, clearing entries as it
/// goes. `level` is 3 for a PDPT, 2 for a PD and 1 for a PT. The table frame
/// itself is left to the caller. Returns how many frames were released.
pub fn release_subtree<A: FrameAllocator + ?Sized>(
    frames: &mut A,
    table: PhysFrame,
    level: u8,
) -> usize {
    let mut released = 0;

    for index in 0..512 {
        // SAFETY: only this walk touches the subtree being torn down.
        let entries = unsafe { table_mut(frames, table) };
        let entry = &mut entries[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let Ok(child) = entry.frame() else {
            entry.set_unused();
            continue;
        };
        entry.set_unused();

        if level > 1 {
            released += release_subtree(frames, child, level - 1);
        }
        frames.release_frame(child);
        released += 1;
    }

    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMachine;

    #[test]
    fn map_then_translate() {
        let mut sim = SimMachine::new();
        let root = sim.allocate_frame(true).unwrap();
        let page = sim.allocate_frame(false).unwrap();
        let va = VirtAddr::new(0x40_0000);

        map_page(&mut sim, root, va, page, PageTableFlags::WRITABLE).unwrap();

        let (frame, flags) = translate(&sim, root, va + 0x123u64).unwrap();
        assert_eq!(frame, page);
        assert!(flags.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE));
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(translate(&sim, root, VirtAddr::new(0x40_1000)).is_none());
    }

    #[test]
    fn remapping_an_occupied_page_is_rejected() {
        let mut sim = SimMachine::new();
        let root = sim.allocate_frame(true).unwrap();
        let a = sim.allocate_frame(false).unwrap();
        let b = sim.allocate_frame(false).unwrap();
        let va = VirtAddr::new(0x1000);

        map_page(&mut sim, root, va, a, PageTableFlags::empty()).unwrap();
        assert_eq!(
            map_page(&mut sim, root, va, b, PageTableFlags::empty()),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(translate(&sim, root, va).unwrap().0, a);
    }

    #[test]
    fn unmap_returns_the_frame() {
        let mut sim = SimMachine::new();
        let root = sim.allocate_frame(true).unwrap();
        let a = sim.allocate_frame(false).unwrap();
        let va = VirtAddr::new(0x7000);

        assert_eq!(unmap_page(&mut sim, root, va), Err(MapError::NotMapped));
        map_page(&mut sim, root, va, a, PageTableFlags::empty()).unwrap();
        assert_eq!(unmap_page(&mut sim, root, va), Ok(a));
        assert!(translate(&sim, root, va).is_none());
    }

    #[test]
    fn subtree_release_returns_leaves_and_tables() {
        let mut sim = SimMachine::new();
        let root = sim.allocate_frame(true).unwrap();
        let baseline = sim.free_frames();

        for n in 0..3u64 {
            let frame = sim.allocate_frame(false).unwrap();
            map_page(&mut sim, root, VirtAddr::new(n * 0x1000), frame, PageTableFlags::empty())
                .unwrap();
        }
        // 3 leaves + PDPT + PD + PT
        assert_eq!(baseline - sim.free_frames(), 6);

        let pdpt = unsafe { table_mut(&sim, root) }[0].frame().unwrap();
        let released = release_subtree(&mut sim, pdpt, 3);
        sim.release_frame(pdpt);
        assert_eq!(released, 5);
        assert_eq!(sim.free_frames(), baseline);
    }
}
