// Architecture Abstraction Layer
//
// The environment core never issues privileged instructions directly. It
// talks to a `Machine`: a frame allocator plus the handful of CPU services
// needed to build and enter address spaces.
//
// Key responsibilities:
// - Define the `Cpu` contract (translation root, fault address, IF state,
//   copies through the active address space)
// - Provide the bare-metal implementation, `X86Machine`
// - Own the descriptor tables and the trap entry/exit stubs
//
// Design principles:
// - Everything that touches real hardware is gated on `target_os = "none"`,
//   so the same core logic builds and runs as a hosted unit-test binary
// - Unsafe is confined to the methods whose contract says so
//
// Correctness and safety notes:
// - `switch_root` must only receive hierarchies that carry the kernel half;
//   the kernel keeps executing after the switch
// - Copies through the active root assume the destination range is mapped;
//   the loader maps before it copies

use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::mm::FrameAllocator;

#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod gdt;
#[cfg(target_os = "none")]
mod machine;

#[cfg(target_os = "none")]
pub use machine::X86Machine;

/// User code segment selector (GDT index 3, RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
/// User data segment selector (GDT index 4, RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// RFLAGS.IF
pub const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS bit 1 is reserved and always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// Processor services the environment core depends on.
pub trait Cpu {
    /// Root of the hierarchy currently used for translation (CR3).
    fn active_root(&self) -> PhysFrame;

    /// Install `root` as the translation root.
    ///
    /// # Safety
    ///
    /// `root` must be a complete hierarchy that maps the kernel half
    /// identically to the current one.
    unsafe fn switch_root(&mut self, root: PhysFrame);

    /// Drop any cached translation for `va` in the active root.
    fn flush_page(&mut self, va: VirtAddr);

    /// Linear address of the most recent page fault (CR2).
    fn fault_address(&self) -> VirtAddr;

    fn interrupts_enabled(&self) -> bool;

    /// Copy `src` to `dst` through the active translation root.
    ///
    /// # Safety
    ///
    /// `[dst, dst + src.len())` must be mapped writable in the active root.
    unsafe fn copy_to_active(&mut self, dst: VirtAddr, src: &[u8]);

    /// # Safety
    ///
    /// `[dst, dst + len)` must be mapped writable in the active root.
    unsafe fn zero_active(&mut self, dst: VirtAddr, len: usize);

    /// # Safety
    ///
    /// `[src, src + dst.len())` must be mapped in the active root.
    unsafe fn copy_from_active(&self, src: VirtAddr, dst: &mut [u8]);
}

pub trait Machine: FrameAllocator + Cpu {}

impl<T: FrameAllocator + Cpu> Machine for T {}

#[inline(always)]
pub fn halt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::hlt();

    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Stop this core for good.
pub fn halt_forever() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    loop {
        halt();
    }
}
