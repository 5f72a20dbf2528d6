// Trap Entry and Exit Stubs
//
// Assembly glue between the CPU's interrupt mechanism and the Rust trap
// dispatcher.
//
// Entry path (per vector):
// - Vectors without a CPU error code push a zero first, so every frame has
//   the same shape
// - The vector number is pushed, then control joins `trap_common`
// - `trap_common` reserves the es/ds slots, pushes rax..r15 so r15 ends up
//   lowest, records es/ds, loads the kernel data selector and calls `trap`
//   with a pointer to the finished `TrapFrame`
//
// Exit path:
// - `trap_frame_pop` points rsp at a `TrapFrame`, pops the general
//   registers, restores es/ds, skips trap number and error code, and
//   `iretq`s into whatever rip/cs/rflags/rsp/ss the frame holds
//
// Correctness and safety notes:
// - The CPU aligns rsp to 16 bytes before pushing its 5-word frame; the 24
//   words of `TrapFrame` keep that alignment for the `call`
// - All gates are interrupt gates, so IF is clear from the first stub
//   instruction until `iretq`
// - Vector numbers and error-code vectors must match `interrupts::trap`

use core::arch::global_asm;

use crate::interrupts::trap::TrapFrame;

/// Architectural exception vectors with a stub in `TRAP_VECTORS`.
pub const EXCEPTION_VECTORS: usize = 20;

global_asm!(
    r#"
.macro TRAP_NOEC vec
.global trap_vector_\vec
trap_vector_\vec:
    push 0
    push \vec
    jmp trap_common
.endm

.macro TRAP_EC vec
.global trap_vector_\vec
trap_vector_\vec:
    push \vec
    jmp trap_common
.endm

TRAP_NOEC 0
TRAP_NOEC 1
TRAP_NOEC 2
TRAP_NOEC 3
TRAP_NOEC 4
TRAP_NOEC 5
TRAP_NOEC 6
TRAP_NOEC 7
TRAP_EC   8
TRAP_NOEC 9
TRAP_EC   10
TRAP_EC   11
TRAP_EC   12
TRAP_EC   13
TRAP_EC   14
TRAP_NOEC 15
TRAP_NOEC 16
TRAP_EC   17
TRAP_NOEC 18
TRAP_NOEC 19
TRAP_NOEC 48

trap_common:
    sub rsp, 16
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    xor eax, eax
    mov ax, es
    mov [rsp + 120], rax
    mov ax, ds
    mov [rsp + 128], rax

    mov ax, 0x10
    mov ds, ax
    mov es, ax

    cld
    mov rdi, rsp
    call trap
    ud2

.global trap_frame_pop
trap_frame_pop:
    mov rsp, rdi
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    mov rax, [rsp + 8]
    mov es, ax
    mov rax, [rsp + 16]
    mov ds, ax
    pop rax
    add rsp, 32
    iretq

.pushsection .rodata
.balign 8
.global trap_vector_table
trap_vector_table:
.irp vec, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19
    .quad trap_vector_\vec
.endr
.popsection
"#
);

extern "C" {
    static trap_vector_table: [u64; EXCEPTION_VECTORS];
    fn trap_vector_48();
    fn trap_frame_pop(frame: *const TrapFrame) -> !;
}

/// Entry stub address for exception vector `vector` (0..20).
pub fn exception_stub(vector: usize) -> Option<u64> {
    // SAFETY: the table is immutable data emitted above.
    unsafe { trap_vector_table.get(vector).copied() }
}

pub fn syscall_stub() -> u64 {
    trap_vector_48 as usize as u64
}

/// Load every register from `frame` and return to the context it describes.
///
/// # Safety
///
/// The translation root must map the code and stack the frame points at,
/// and nothing may still borrow kernel state that the popped context could
/// touch (the kernel lock in particular must already be released).
pub unsafe fn pop_trap_frame(frame: &TrapFrame) -> ! {
    trap_frame_pop(frame as *const TrapFrame)
}
