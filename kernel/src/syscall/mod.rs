// System Call Layer
//
// Decodes and executes the calls user environments make through the
// `int 0x30` gate. The trap dispatcher hands over the raw register values;
// this module owns the numbering, the argument convention and the error
// codes user space sees.
//
// ABI:
// - rax carries the call number
// - Arguments in rdx, rcx, rbx, rdi, rsi (in that order)
// - The signed result goes back in the caller's saved rax; negative values
//   are `-E_*` error codes
//
// Call table:
// - SYS_CPUTS        print a user buffer to the console
// - SYS_CGETC        console input (there is none; always 0)
// - SYS_GETENVID     id of the caller
// - SYS_ENV_DESTROY  destroy the caller or one of its children
// - SYS_YIELD        give the CPU to the next runnable environment
//
// Correctness and safety notes:
// - User pointers are never dereferenced before `user_mem_check` accepts
//   the whole range against the caller's own address space
// - A call that destroys its caller still returns a value; the dispatcher
//   drops it because the caller's record is gone
// - Unknown numbers are answered with -E_INVAL rather than killing the
//   caller

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::arch::Machine;
use crate::env::{EnvError, EnvId};
use crate::monitor::Monitor;
use crate::system::Kernel;
use crate::{log_debug, log_info, log_warn, serial_print};

const LOG_ORIGIN: &str = "syscall";

pub const SYS_CPUTS: u64 = 0;
pub const SYS_CGETC: u64 = 1;
pub const SYS_GETENVID: u64 = 2;
pub const SYS_ENV_DESTROY: u64 = 3;
pub const SYS_YIELD: u64 = 4;

pub const E_BAD_ENV: i64 = 2;
pub const E_INVAL: i64 = 3;
pub const E_NO_MEM: i64 = 4;
pub const E_NO_FREE_ENV: i64 = 5;
pub const E_FAULT: i64 = 6;

/// Chunk size used when streaming a user buffer to the console.
const CPUTS_CHUNK: usize = 128;

/// Register arguments in ABI order: rdx, rcx, rbx, rdi, rsi.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs(pub [u64; 5]);

impl EnvError {
    /// The `-E_*` value user space sees for this error.
    pub fn to_errno(self) -> i64 {
        -match self {
            EnvError::PoolExhausted => E_NO_FREE_ENV,
            EnvError::OutOfMemory => E_NO_MEM,
            EnvError::UnknownEnvironment | EnvError::PermissionDenied => E_BAD_ENV,
        }
    }
}

/// Run call `number` on behalf of the current environment and return the
/// value destined for its rax.
pub fn dispatch<M: Machine, D: Monitor, const N: usize>(
    kernel: &mut Kernel<M, D, N>,
    number: u64,
    args: SyscallArgs,
) -> i64 {
    let [a1, a2, _a3, _a4, _a5] = args.0;

    log_debug!(
        LOG_ORIGIN,
        "env {} syscall {} args={:x?}",
        kernel.pool.current_id(),
        number,
        args.0
    );

    match number {
        SYS_CPUTS => sys_cputs(kernel, a1, a2 as usize),
        SYS_CGETC => sys_cgetc(),
        SYS_GETENVID => sys_getenvid(kernel),
        SYS_ENV_DESTROY => sys_env_destroy(kernel, EnvId::from_raw(a1 as u32)),
        SYS_YIELD => sys_yield(kernel),
        _ => {
            log_warn!(LOG_ORIGIN, "unknown syscall {}", number);
            -E_INVAL
        }
    }
}

fn sys_cputs<M: Machine, D: Monitor, const N: usize>(
    kernel: &mut Kernel<M, D, N>,
    va: u64,
    len: usize,
) -> i64 {
    if !kernel.user_mem_assert(va, len, PageTableFlags::USER_ACCESSIBLE) {
        return -E_FAULT;
    }

    let mut buf = [0u8; CPUTS_CHUNK];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(CPUTS_CHUNK);
        // SAFETY: the whole range was checked against the caller's space,
        // which is the active root while its trap is being handled.
        unsafe {
            kernel
                .machine
                .copy_from_active(VirtAddr::new_truncate(va + done as u64), &mut buf[..n]);
        }
        for &byte in &buf[..n] {
            serial_print!("{}", byte as char);
        }
        done += n;
    }

    0
}

fn sys_cgetc() -> i64 {
    0
}

fn sys_getenvid<M: Machine, D: Monitor, const N: usize>(kernel: &Kernel<M, D, N>) -> i64 {
    kernel.pool.current_id().raw() as i64
}

fn sys_env_destroy<M: Machine, D: Monitor, const N: usize>(
    kernel: &mut Kernel<M, D, N>,
    id: EnvId,
) -> i64 {
    let caller = kernel.pool.current_id();
    let target = match kernel.pool.lookup(id, true) {
        Ok(env) => env.id,
        Err(err) => return err.to_errno(),
    };

    if target == caller {
        log_info!(LOG_ORIGIN, "[{:08x}] exiting gracefully", caller);
    } else {
        log_info!(LOG_ORIGIN, "[{:08x}] destroying {:08x}", caller, target);
    }

    match kernel.destroy(target) {
        Ok(()) => 0,
        Err(_) => -E_BAD_ENV,
    }
}

fn sys_yield<M: Machine, D: Monitor, const N: usize>(kernel: &mut Kernel<M, D, N>) -> i64 {
    kernel.yield_current();
    0
}
