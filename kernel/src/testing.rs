// Host-side test doubles: a simulated machine backed by a heap arena, a
// monitor that records what it was shown, and a small ELF image builder.

use std::cell::UnsafeCell;
use std::vec::Vec;

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::Cpu;
use crate::executable::PT_LOAD;
use crate::interrupts::trap::TrapFrame;
use crate::mm::paging::{self, table_mut};
use crate::mm::pmm::FrameTable;
use crate::mm::{FrameAllocator, MemoryError, PAGE_SIZE, SELF_MAP_SLOT};
use crate::monitor::Monitor;
use crate::system::Kernel;

pub const SIM_FRAMES: usize = 256;

/// Byte pattern handed out in frames allocated without zeroing.
pub const DIRTY_BYTE: u8 = 0xAA;

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

/// Physical memory is an arena of `SIM_FRAMES` pages; physical address
/// `n * PAGE_SIZE` is arena page `n`. Copies "through the active root"
/// really walk the active hierarchy.
pub struct SimMachine {
    memory: Box<[UnsafeCell<Page>]>,
    frames: FrameTable<SIM_FRAMES>,
    kernel_root: PhysFrame,
    active_root: PhysFrame,
    fault_va: VirtAddr,
    interrupts: bool,
    allocations: usize,
    budget: Option<usize>,
    switches: Vec<PhysFrame>,
    flushed: Vec<VirtAddr>,
}

impl SimMachine {
    pub fn new() -> Self {
        let memory = (0..SIM_FRAMES)
            .map(|_| UnsafeCell::new(Page([0; PAGE_SIZE])))
            .collect();
        let mut frames = FrameTable::new();
        frames.add_free_range(PhysAddr::new(0), SIM_FRAMES);

        let placeholder = PhysFrame::containing_address(PhysAddr::new(0));
        let mut sim = Self {
            memory,
            frames,
            kernel_root: placeholder,
            active_root: placeholder,
            fault_va: VirtAddr::zero(),
            interrupts: false,
            allocations: 0,
            budget: None,
            switches: Vec::new(),
            flushed: Vec::new(),
        };

        // A boot hierarchy with something in the kernel half to share.
        let root = sim.allocate_frame(true).unwrap();
        for slot in [256, 511] {
            let pdpt = sim.allocate_frame(true).unwrap();
            let table = unsafe { table_mut(&sim, root) };
            table[slot].set_frame(pdpt, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        }
        sim.kernel_root = root;
        sim.active_root = root;
        sim
    }

    pub fn kernel_root(&self) -> PhysFrame {
        self.kernel_root
    }

    /// Let `n` more allocations succeed, then fail every one after.
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.budget = Some(n);
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn set_fault_address(&mut self, va: u64) {
        self.fault_va = VirtAddr::new(va);
    }

    pub fn set_interrupts(&mut self, enabled: bool) {
        self.interrupts = enabled;
    }

    /// How many times `root` has been installed.
    pub fn switches_to(&self, root: PhysFrame) -> usize {
        self.switches.iter().filter(|&&r| r == root).count()
    }

    pub fn flushed_pages(&self) -> &[VirtAddr] {
        &self.flushed
    }

    /// Intermediate tables (PDPT, PD, PT) reachable from the user half of
    /// `root`.
    pub fn page_table_frames(&self, root: PhysFrame) -> usize {
        let table = unsafe { table_mut(self, root) };
        (0..SELF_MAP_SLOT)
            .filter_map(|slot| present_child(&table[slot]))
            .map(|pdpt| 1 + self.tables_below(pdpt, 3))
            .sum()
    }

    fn tables_below(&self, table: PhysFrame, level: u8) -> usize {
        if level == 1 {
            return 0;
        }
        let table = unsafe { table_mut(self, table) };
        table
            .iter()
            .filter_map(present_child)
            .map(|child| 1 + self.tables_below(child, level - 1))
            .sum()
    }

    fn for_each_chunk(&self, va: VirtAddr, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut done = 0;
        while done < len {
            let addr = va + done as u64;
            let offset = (addr.as_u64() % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let (frame, _) = paging::translate(self, self.active_root, addr)
                .unwrap_or_else(|| panic!("access to unmapped {:#x}", addr.as_u64()));
            let ptr = unsafe { self.frame_ptr(frame).add(offset) };
            f(ptr, done, chunk);
            done += chunk;
        }
    }
}

fn present_child(entry: &x86_64::structures::paging::page_table::PageTableEntry) -> Option<PhysFrame> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        entry.frame().ok()
    } else {
        None
    }
}

impl FrameAllocator for SimMachine {
    fn allocate_frame(&mut self, zero: bool) -> Result<PhysFrame, MemoryError> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return Err(MemoryError::OutOfMemory);
            }
            *budget -= 1;
        }

        let frame = self.frames.alloc().ok_or(MemoryError::OutOfMemory)?;
        let fill = if zero { 0 } else { DIRTY_BYTE };
        unsafe { core::ptr::write_bytes(self.frame_ptr(frame), fill, PAGE_SIZE) };
        self.allocations += 1;
        Ok(frame)
    }

    fn release_frame(&mut self, frame: PhysFrame) {
        self.frames.release(frame);
    }

    fn frame_ptr(&self, frame: PhysFrame) -> *mut u8 {
        let index = frame.start_address().as_u64() as usize / PAGE_SIZE;
        self.memory[index].get() as *mut u8
    }

    fn free_frames(&self) -> usize {
        self.frames.free()
    }
}

impl Cpu for SimMachine {
    fn active_root(&self) -> PhysFrame {
        self.active_root
    }

    unsafe fn switch_root(&mut self, root: PhysFrame) {
        self.switches.push(root);
        self.active_root = root;
    }

    fn flush_page(&mut self, va: VirtAddr) {
        self.flushed.push(va);
    }

    fn fault_address(&self) -> VirtAddr {
        self.fault_va
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    unsafe fn copy_to_active(&mut self, dst: VirtAddr, src: &[u8]) {
        self.for_each_chunk(dst, src.len(), |ptr, done, len| unsafe {
            core::ptr::copy_nonoverlapping(src[done..].as_ptr(), ptr, len)
        });
    }

    unsafe fn zero_active(&mut self, dst: VirtAddr, len: usize) {
        self.for_each_chunk(dst, len, |ptr, _, len| unsafe { core::ptr::write_bytes(ptr, 0, len) });
    }

    unsafe fn copy_from_active(&self, src: VirtAddr, dst: &mut [u8]) {
        let len = dst.len();
        self.for_each_chunk(src, len, |ptr, done, len| unsafe {
            core::ptr::copy_nonoverlapping(ptr, dst[done..].as_mut_ptr(), len)
        });
    }
}

/// Remembers every frame the monitor was entered with.
#[derive(Default)]
pub struct RecordingMonitor {
    pub entries: Vec<Option<TrapFrame>>,
}

impl Monitor for RecordingMonitor {
    fn enter(&mut self, frame: Option<&TrapFrame>) {
        self.entries.push(frame.copied());
    }
}

pub type TestKernel = Kernel<SimMachine, RecordingMonitor, 8>;

/// An initialised kernel over a fresh `SimMachine`.
pub fn test_kernel() -> TestKernel {
    let machine = SimMachine::new();
    let root = machine.kernel_root();
    let mut kernel = Kernel::new(machine, RecordingMonitor::default());
    kernel.init(root);
    kernel
}

struct SegmentSpec {
    p_type: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Builds minimal little-endian ELF64 executables: header, program header
/// table, then segment data in declaration order.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<SegmentSpec>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(SegmentSpec {
            p_type: PT_LOAD,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// A PT_NOTE header; it carries no file bytes.
    pub fn note(mut self, vaddr: u64, memsz: u64) -> Self {
        self.segments.push(SegmentSpec {
            p_type: 4,
            vaddr,
            data: Vec::new(),
            memsz,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);
        assert_eq!(out.len(), EHDR);

        let mut offset = EHDR + PHDR * self.segments.len();
        for seg in &self.segments {
            out.extend_from_slice(&seg.p_type.to_le_bytes());
            out.extend_from_slice(&7u32.to_le_bytes());
            out.extend_from_slice(&(offset as u64).to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
            offset += seg.data.len();
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}
