// Trap Subsystem
//
// Ties together the frame layout (`trap`), the dispatcher (`handlers`) and,
// on bare metal, the descriptor table that routes vectors to the entry
// stubs (`idt`).
//
// Initialization flow:
// - `arch::gdt::init` must have run, so the TSS and selectors exist
// - `init()` installs the IDT
// - Interrupts stay disabled for the life of the kernel; the only ways in
//   are exceptions and the `int 0x30` system-call gate

pub mod handlers;
#[cfg(target_os = "none")]
pub mod idt;
pub mod trap;

#[cfg(target_os = "none")]
pub fn init() {
    idt::init();
}
