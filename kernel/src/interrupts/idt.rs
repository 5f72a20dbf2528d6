// Interrupt Descriptor Table (IDT) Setup
//
// Points every vector the kernel handles at its entry stub in
// `arch::entry` and loads the table with `lidt`.
//
// Key responsibilities:
// - Define the exact hardware layout of IDT entries (16-byte descriptors)
// - Install the 20 architectural exception vectors with DPL 0, except the
//   breakpoint which user code may raise with `int3`
// - Install the system-call vector (48) with DPL 3
// - Route the double fault through IST 1 so a broken kernel stack still
//   produces a report
//
// Design principles:
// - Every gate is an interrupt gate: IF is cleared on entry and stays clear
//   for the whole dispatch, which the dispatcher checks
// - Vectors without a stub stay non-present; raising one is a #GP, which is
//   itself reported through vector 13
//
// Correctness and safety notes:
// - The table is static and 16-byte aligned; it is written once, before
//   `lidt`, while interrupts are off
// - Stub addresses must be mapped in every address space; they live in the
//   kernel half, which all spaces share

use core::mem::size_of;

use crate::arch::entry::{exception_stub, syscall_stub, EXCEPTION_VECTORS};
use crate::arch::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::arch::KERNEL_CODE_SELECTOR;
use crate::interrupts::trap::{T_BRKPT, T_DBLFLT, T_SYSCALL};
use crate::{log_debug, log_info};

const IDT_SIZE: usize = 256;
const LOG_ORIGIN: &str = "idt";

const GATE_TYPE_INTERRUPT: u8 = 0x8E;
const DPL_RING3: u8 = 0x60;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set_handler(&mut self, handler: u64, selector: u16, ist: u8, type_attr: u8) {
        self.offset_low = (handler & 0xFFFF) as u16;
        self.offset_mid = ((handler >> 16) & 0xFFFF) as u16;
        self.offset_high = ((handler >> 32) & 0xFFFF_FFFF) as u32;
        self.selector = selector;
        self.ist = ist & 0x07;
        self.type_attr = type_attr;
        self.reserved = 0;
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; IDT_SIZE],
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

static mut IDT: Idt = Idt {
    entries: [IdtEntry::missing(); IDT_SIZE],
};

pub fn init() {
    // SAFETY: single-threaded early boot with interrupts disabled; nothing
    // else references the table until `lidt`.
    let entries = unsafe { &mut *core::ptr::addr_of_mut!(IDT.entries) };

    for vector in 0..EXCEPTION_VECTORS {
        let Some(stub) = exception_stub(vector) else {
            continue;
        };
        let (ist, type_attr) = match vector as u64 {
            T_DBLFLT => (DOUBLE_FAULT_IST_INDEX as u8 + 1, GATE_TYPE_INTERRUPT),
            T_BRKPT => (0, GATE_TYPE_INTERRUPT | DPL_RING3),
            _ => (0, GATE_TYPE_INTERRUPT),
        };
        entries[vector].set_handler(stub, KERNEL_CODE_SELECTOR, ist, type_attr);
    }

    entries[T_SYSCALL as usize].set_handler(
        syscall_stub(),
        KERNEL_CODE_SELECTOR,
        0,
        GATE_TYPE_INTERRUPT | DPL_RING3,
    );

    log_debug!(
        LOG_ORIGIN,
        "page fault stub {:#x}, syscall stub {:#x}",
        exception_stub(14).unwrap_or(0),
        syscall_stub()
    );

    let idt_ptr = IdtPointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as u64,
    };
    // SAFETY: the table is 'static and fully initialised.
    unsafe { load_idt(&idt_ptr) };

    log_info!(
        LOG_ORIGIN,
        "IDT loaded: {} exception vectors, syscall at {}",
        EXCEPTION_VECTORS,
        T_SYSCALL
    );
}

#[inline]
unsafe fn load_idt(idt_ptr: &IdtPointer) {
    core::arch::asm!(
        "lidt [{}]",
        in(reg) idt_ptr,
        options(readonly, nostack, preserves_flags)
    );
}
