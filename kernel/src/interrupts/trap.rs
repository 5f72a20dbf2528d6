// Trap Frames and Trap Classification
//
// `TrapFrame` is the exact image the entry stubs in `arch::entry` build on
// the kernel stack, and the exact image `pop_trap_frame` consumes when an
// environment is resumed. Each environment keeps one as its saved state.
//
// Layout (lowest address first):
// - r15 … rax, pushed by the common stub
// - es, ds, saved by the common stub
// - trap number, pushed by the per-vector stub
// - error code, pushed by the CPU or as a zero by the per-vector stub
// - rip, cs, rflags, rsp, ss, pushed by the CPU
//
// The CPU always pushes rsp/ss in long mode, but they only describe a user
// stack when the trap came from ring 3; the dump omits them otherwise.

use core::fmt;

use x86_64::VirtAddr;

use crate::arch::{RFLAGS_RESERVED, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::log::{self, LogLevel};

pub const T_DIVIDE: u64 = 0;
pub const T_BRKPT: u64 = 3;
pub const T_DBLFLT: u64 = 8;
pub const T_PGFLT: u64 = 14;
pub const T_SIMDERR: u64 = 19;
pub const T_SYSCALL: u64 = 48;

const LOG_ORIGIN: &str = "trap";

// Page-fault error code bits.
const PF_PROTECTION: u64 = 1 << 0;
const PF_WRITE: u64 = 1 << 1;
const PF_USER: u64 = 1 << 2;

const EXCEPTION_NAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

pub fn trap_name(trap_number: u64) -> &'static str {
    match trap_number {
        n if n < EXCEPTION_NAMES.len() as u64 => EXCEPTION_NAMES[n as usize],
        T_SYSCALL => "System call",
        _ => "(unknown trap)",
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

impl GeneralRegisters {
    pub const fn zero() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: GeneralRegisters,
    pub es: u64,
    pub ds: u64,
    pub trap_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<TrapFrame>() == 24 * 8);

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            regs: GeneralRegisters::zero(),
            es: 0,
            ds: 0,
            trap_number: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Frame a fresh environment starts from: ring-3 selectors, the given
    /// stack top, interrupts masked and no entry point yet.
    pub const fn new_user(stack_top: u64) -> Self {
        let mut frame = Self::zero();
        frame.ds = USER_DATA_SELECTOR as u64;
        frame.es = USER_DATA_SELECTOR as u64;
        frame.ss = USER_DATA_SELECTOR as u64;
        frame.cs = USER_CODE_SELECTOR as u64;
        frame.rsp = stack_top;
        frame.rflags = RFLAGS_RESERVED;
        frame
    }

    /// True when the trap was taken while running at CPL 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// What the dispatcher does with a trap, decided once from its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    PageFault,
    Breakpoint,
    Syscall,
    Unknown(u64),
}

impl Trap {
    pub fn from_number(trap_number: u64) -> Self {
        match trap_number {
            T_PGFLT => Trap::PageFault,
            T_BRKPT => Trap::Breakpoint,
            T_SYSCALL => Trap::Syscall,
            other => Trap::Unknown(other),
        }
    }
}

/// Page-fault error code rendered as `[user, write, protection]`.
pub struct PageFaultCode(pub u64);

impl fmt::Display for PageFaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.0;
        write!(
            f,
            "[{}, {}, {}]",
            if code & PF_USER != 0 { "user" } else { "kernel" },
            if code & PF_WRITE != 0 { "write" } else { "read" },
            if code & PF_PROTECTION != 0 { "protection" } else { "not-present" },
        )
    }
}

macro_rules! dump_line {
    ($level:expr, $($arg:tt)*) => {
        log::_log($level, LOG_ORIGIN, format_args!($($arg)*), file!(), line!())
    };
}

/// Print every field of `frame`. `fault_va` is shown for page faults.
pub fn dump(level: LogLevel, frame: &TrapFrame, fault_va: Option<VirtAddr>) {
    let r = &frame.regs;

    dump_line!(level, "TRAP frame at {:p}", frame);
    dump_line!(level, "  rax  {:#018x}  rbx  {:#018x}  rcx  {:#018x}", r.rax, r.rbx, r.rcx);
    dump_line!(level, "  rdx  {:#018x}  rsi  {:#018x}  rdi  {:#018x}", r.rdx, r.rsi, r.rdi);
    dump_line!(level, "  rbp  {:#018x}  r8   {:#018x}  r9   {:#018x}", r.rbp, r.r8, r.r9);
    dump_line!(level, "  r10  {:#018x}  r11  {:#018x}  r12  {:#018x}", r.r10, r.r11, r.r12);
    dump_line!(level, "  r13  {:#018x}  r14  {:#018x}  r15  {:#018x}", r.r13, r.r14, r.r15);
    dump_line!(level, "  es   0x----{:04x}", frame.es);
    dump_line!(level, "  ds   0x----{:04x}", frame.ds);
    dump_line!(level, "  trap {:#010x} {}", frame.trap_number, trap_name(frame.trap_number));

    if frame.trap_number == T_PGFLT {
        if let Some(va) = fault_va {
            dump_line!(level, "  cr2  {:#018x}", va.as_u64());
        }
        dump_line!(level, "  err  {:#010x} {}", frame.error_code, PageFaultCode(frame.error_code));
    } else {
        dump_line!(level, "  err  {:#010x}", frame.error_code);
    }

    dump_line!(level, "  rip  {:#018x}", frame.rip);
    dump_line!(level, "  cs   0x----{:04x}", frame.cs);
    dump_line!(level, "  flag {:#018x}", frame.rflags);
    if frame.from_user() {
        dump_line!(level, "  rsp  {:#018x}", frame.rsp);
        dump_line!(level, "  ss   0x----{:04x}", frame.ss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_closed_over_known_traps() {
        assert_eq!(Trap::from_number(14), Trap::PageFault);
        assert_eq!(Trap::from_number(3), Trap::Breakpoint);
        assert_eq!(Trap::from_number(48), Trap::Syscall);
        assert_eq!(Trap::from_number(13), Trap::Unknown(13));
        assert_eq!(Trap::from_number(200), Trap::Unknown(200));
    }

    #[test]
    fn names_cover_exceptions_and_syscall() {
        assert_eq!(trap_name(T_DIVIDE), "Divide error");
        assert_eq!(trap_name(T_PGFLT), "Page Fault");
        assert_eq!(trap_name(T_SIMDERR), "SIMD Floating-Point Exception");
        assert_eq!(trap_name(T_SYSCALL), "System call");
        assert_eq!(trap_name(33), "(unknown trap)");
        assert_eq!(trap_name(T_DBLFLT), "Double Fault");
    }

    #[test]
    fn page_fault_code_decodes_three_bits() {
        assert_eq!(
            PageFaultCode(PF_USER | PF_WRITE).to_string(),
            "[user, write, not-present]"
        );
        assert_eq!(PageFaultCode(PF_PROTECTION).to_string(), "[kernel, read, protection]");
    }

    #[test]
    fn user_frame_starts_in_ring_three_with_interrupts_masked() {
        let frame = TrapFrame::new_user(0x7000);
        assert!(frame.from_user());
        assert_eq!(frame.rsp, 0x7000);
        assert_eq!(frame.rip, 0);
        assert_eq!(frame.ss & 3, 3);
        assert_eq!(frame.rflags & crate::arch::RFLAGS_IF, 0);
        assert!(!TrapFrame::zero().from_user());
    }

    #[test]
    fn layout_matches_the_entry_stub() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(TrapFrame, es), 15 * 8);
        assert_eq!(offset_of!(TrapFrame, ds), 16 * 8);
        assert_eq!(offset_of!(TrapFrame, trap_number), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 19 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 23 * 8);
    }
}
