// Trap Dispatch
//
// Rust side of every trap. The entry stubs hand over a `TrapFrame`; this
// module decides what the trap means and what runs afterwards.
//
// Dispatch flow:
// - Check that IF is clear; a trap with interrupts enabled means a gate or
//   stub is misconfigured, which is fatal
// - For a trap from ring 3, copy the frame into the current environment's
//   saved state and work on that copy from then on
// - Match once on `Trap`:
//   - PageFault: fatal from ring 0; from ring 3 log the fault, dump the
//     frame and destroy the environment
//   - Breakpoint: enter the monitor with the frame, then carry on
//   - Syscall: decode rax/rdx/rcx/rbx/rdi/rsi, run the call and store the
//     result in the caller's saved rax
//   - Unknown: dump; fatal from ring 0, destroys the environment from ring 3
// - Kernel-mode traps that survive resume the interrupted kernel frame;
//   user-mode traps go through the scheduler
//
// Error handling:
// - Everything fatal comes back as `KernelError`; only the bare-metal
//   `trap` entry turns it into report + halt
// - The kernel lock is taken with `try_lock`; if it is already held, a trap
//   hit the kernel mid-dispatch and there is no state left to trust

use crate::arch::Machine;
use crate::interrupts::trap::{self, Trap, TrapFrame};
use crate::log::LogLevel;
use crate::monitor::Monitor;
use crate::syscall::{self, SyscallArgs};
use crate::system::{Kernel, KernelError};
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "trap";

impl<M: Machine, D: Monitor, const N: usize> Kernel<M, D, N> {
    /// Handle one trap. On return the pool reflects its effect; what to run
    /// next is decided by `dispatch_trap`.
    pub fn handle_trap(&mut self, tf: &TrapFrame) -> Result<(), KernelError> {
        if self.machine.interrupts_enabled() {
            return Err(KernelError::InterruptsEnabled);
        }

        let frame = if tf.from_user() {
            let env = self
                .pool
                .current_mut()
                .ok_or(KernelError::NoCurrentEnvironment)?;
            env.saved_frame = *tf;
            env.saved_frame
        } else {
            *tf
        };

        log_debug!(
            LOG_ORIGIN,
            "trap {} ({}) from {} rip={:#x}",
            frame.trap_number,
            trap::trap_name(frame.trap_number),
            if frame.from_user() { "user" } else { "kernel" },
            frame.rip
        );

        match Trap::from_number(frame.trap_number) {
            Trap::PageFault => self.page_fault(&frame),
            Trap::Breakpoint => {
                self.monitor.enter(Some(&frame));
                Ok(())
            }
            Trap::Syscall if frame.from_user() => {
                self.syscall(&frame);
                Ok(())
            }
            Trap::Syscall => Err(KernelError::UnhandledTrap(frame.trap_number)),
            // Fatal kernel-mode traps are dumped once, by `report_fatal`.
            Trap::Unknown(number) if !frame.from_user() => Err(KernelError::UnhandledTrap(number)),
            Trap::Unknown(_) => {
                trap::dump(LogLevel::Error, &frame, None);
                self.destroy(self.pool.current_id())
            }
        }
    }

    fn page_fault(&mut self, frame: &TrapFrame) -> Result<(), KernelError> {
        let va = self.machine.fault_address();

        if !frame.from_user() {
            return Err(KernelError::KernelModeFault {
                va: va.as_u64(),
                rip: frame.rip,
            });
        }

        let id = self.pool.current_id();
        log_info!(
            LOG_ORIGIN,
            "[{:08x}] user fault va {:08x} ip {:08x}",
            id,
            va.as_u64(),
            frame.rip
        );
        trap::dump(LogLevel::Info, frame, Some(va));
        self.destroy(id)
    }

    fn syscall(&mut self, frame: &TrapFrame) {
        let caller = self.pool.current_id();
        let r = &frame.regs;
        let result = syscall::dispatch(self, r.rax, SyscallArgs([r.rdx, r.rcx, r.rbx, r.rdi, r.rsi]));

        // The call may have destroyed its own caller.
        if let Ok(env) = self.pool.lookup_mut(caller, false) {
            env.saved_frame.regs.rax = result as u64;
        }
    }

    /// Handle `tf` and return the frame to resume, or `None` when no
    /// environment is left to run.
    pub fn dispatch_trap(&mut self, tf: &TrapFrame) -> Result<Option<TrapFrame>, KernelError> {
        self.handle_trap(tf)?;
        if tf.from_user() {
            self.schedule()
        } else {
            Ok(Some(*tf))
        }
    }
}

/// Called by `trap_common` with the frame it built on the kernel stack.
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn trap(tf: &TrapFrame) -> ! {
    use crate::arch::halt_forever;
    use crate::log_panic;
    use crate::system::KERNEL;

    let next = {
        let Some(mut kernel) = KERNEL.try_lock() else {
            trap::dump(LogLevel::Panic, tf, None);
            log_panic!(LOG_ORIGIN, "fatal: {}", KernelError::ReentrantTrap);
            halt_forever();
        };

        match kernel.dispatch_trap(tf) {
            Ok(next) => next,
            Err(err) => {
                kernel.report_fatal(&err, Some(tf));
                None
            }
        }
    };

    match next {
        Some(frame) => crate::sched::run(&frame),
        None => halt_forever(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Cpu, RFLAGS_IF};
    use crate::env::{EnvError, EnvId, EnvStatus, EnvType};
    use crate::interrupts::trap::{T_BRKPT, T_PGFLT, T_SYSCALL};
    use crate::mm::FrameAllocator;
    use crate::syscall::{E_INVAL, SYS_GETENVID};
    use crate::testing::{test_kernel, ElfBuilder, TestKernel};

    fn running_env(kernel: &mut TestKernel) -> (EnvId, TrapFrame) {
        let image = ElfBuilder::new(0x80_0000).segment(0x80_0000, &[0xCC; 16], 16).build();
        let id = kernel.create(&image, EnvType::User).unwrap();
        let frame = kernel.switch_to(id).unwrap();
        (id, frame)
    }

    fn user_trap(base: &TrapFrame, number: u64) -> TrapFrame {
        let mut tf = *base;
        tf.trap_number = number;
        tf.rip = base.rip + 2;
        tf
    }

    #[test]
    fn interrupts_enabled_is_fatal() {
        let mut kernel = test_kernel();
        let (_, base) = running_env(&mut kernel);
        kernel.machine.set_interrupts(true);

        assert_eq!(
            kernel.handle_trap(&user_trap(&base, T_BRKPT)),
            Err(KernelError::InterruptsEnabled)
        );
    }

    #[test]
    fn user_trap_without_current_environment_is_fatal() {
        let mut kernel = test_kernel();
        let tf = user_trap(&TrapFrame::new_user(0x1000), T_BRKPT);
        assert_eq!(kernel.handle_trap(&tf), Err(KernelError::NoCurrentEnvironment));
    }

    #[test]
    fn user_trap_saves_the_frame() {
        let mut kernel = test_kernel();
        let (id, base) = running_env(&mut kernel);
        let mut tf = user_trap(&base, T_BRKPT);
        tf.regs.r12 = 0x1234;

        kernel.handle_trap(&tf).unwrap();
        assert_eq!(kernel.pool.lookup(id, false).unwrap().saved_frame, tf);
    }

    #[test]
    fn breakpoint_enters_the_monitor_and_resumes() {
        let mut kernel = test_kernel();
        let (id, base) = running_env(&mut kernel);
        let tf = user_trap(&base, T_BRKPT);

        let next = kernel.dispatch_trap(&tf).unwrap().unwrap();
        assert_eq!(kernel.monitor.entries, vec![Some(tf)]);
        assert_eq!(next.rip, tf.rip);
        assert_eq!(kernel.pool.current_id(), id);
    }

    #[test]
    fn kernel_breakpoint_resumes_the_kernel_frame() {
        let mut kernel = test_kernel();
        let mut tf = TrapFrame::zero();
        tf.trap_number = T_BRKPT;
        tf.cs = crate::arch::KERNEL_CODE_SELECTOR as u64;
        tf.rip = 0xFFFF_8000_0010_0000;

        assert_eq!(kernel.dispatch_trap(&tf), Ok(Some(tf)));
        assert_eq!(kernel.monitor.entries.len(), 1);
    }

    #[test]
    fn kernel_page_fault_is_fatal() {
        let mut kernel = test_kernel();
        kernel.machine.set_fault_address(0xdead_b000);
        let mut tf = TrapFrame::zero();
        tf.trap_number = T_PGFLT;
        tf.cs = crate::arch::KERNEL_CODE_SELECTOR as u64;
        tf.rip = 0xFFFF_8000_0000_2000;

        assert_eq!(
            kernel.handle_trap(&tf),
            Err(KernelError::KernelModeFault {
                va: 0xdead_b000,
                rip: 0xFFFF_8000_0000_2000
            })
        );
    }

    #[test]
    fn user_page_fault_destroys_only_that_environment() {
        let mut kernel = test_kernel();
        let (victim, base) = running_env(&mut kernel);
        let image = ElfBuilder::new(0x40_0000).segment(0x40_0000, &[1], 1).build();
        let bystander = kernel.create(&image, EnvType::User).unwrap();
        kernel.machine.set_fault_address(0x10);

        let next = kernel.dispatch_trap(&user_trap(&base, T_PGFLT)).unwrap().unwrap();

        assert_eq!(
            kernel.pool.lookup(victim, false).unwrap_err(),
            EnvError::UnknownEnvironment
        );
        assert_eq!(kernel.pool.current_id(), bystander);
        assert_eq!(next.rip, 0x40_0000);
    }

    #[test]
    fn user_page_fault_frames_are_reusable() {
        let mut kernel = test_kernel();
        let baseline = kernel.machine.free_frames();
        let (_, base) = running_env(&mut kernel);

        let next = kernel.dispatch_trap(&user_trap(&base, T_PGFLT)).unwrap();
        assert_eq!(next, None);
        assert_eq!(kernel.machine.free_frames(), baseline);
        assert_eq!(kernel.monitor.entries, vec![None]);

        // The template still works for a fresh environment.
        running_env(&mut kernel);
    }

    #[test]
    fn syscall_result_lands_in_rax() {
        let mut kernel = test_kernel();
        let (id, base) = running_env(&mut kernel);
        let mut tf = user_trap(&base, T_SYSCALL);
        tf.regs.rax = SYS_GETENVID;

        let next = kernel.dispatch_trap(&tf).unwrap().unwrap();
        assert_eq!(next.regs.rax, id.raw() as u64);
        assert_eq!(
            kernel.pool.lookup(id, false).unwrap().saved_frame.regs.rax,
            id.raw() as u64
        );
    }

    #[test]
    fn unknown_syscall_number_returns_einval() {
        let mut kernel = test_kernel();
        let (id, base) = running_env(&mut kernel);
        let mut tf = user_trap(&base, T_SYSCALL);
        tf.regs.rax = 77;

        kernel.handle_trap(&tf).unwrap();
        let rax = kernel.pool.lookup(id, false).unwrap().saved_frame.regs.rax;
        assert_eq!(rax as i64, -E_INVAL);
    }

    #[test]
    fn syscall_from_kernel_mode_is_fatal() {
        let mut kernel = test_kernel();
        let mut tf = TrapFrame::zero();
        tf.trap_number = T_SYSCALL;
        assert_eq!(kernel.handle_trap(&tf), Err(KernelError::UnhandledTrap(T_SYSCALL)));
    }

    #[test]
    fn unknown_user_trap_destroys_the_environment() {
        let mut kernel = test_kernel();
        let (id, base) = running_env(&mut kernel);

        kernel.handle_trap(&user_trap(&base, 13)).unwrap();
        assert!(kernel.pool.lookup(id, false).is_err());
        assert!(kernel.pool.current().is_none());
    }

    #[test]
    fn unknown_kernel_trap_is_fatal() {
        let mut kernel = test_kernel();
        let tf = TrapFrame {
            trap_number: 6,
            ..TrapFrame::zero()
        };
        assert_eq!(kernel.handle_trap(&tf), Err(KernelError::UnhandledTrap(6)));
    }

    #[test]
    fn fatal_kernel_traps_are_left_to_the_fatal_report() {
        let mut kernel = test_kernel();
        let mut tf = TrapFrame::zero();
        tf.trap_number = T_PGFLT;
        tf.cs = crate::arch::KERNEL_CODE_SELECTOR as u64;

        let err = kernel.dispatch_trap(&tf).unwrap_err();
        assert!(matches!(err, KernelError::KernelModeFault { .. }));
        assert!(kernel.monitor.entries.is_empty());

        kernel.report_fatal(&err, Some(&tf));
        assert_eq!(kernel.monitor.entries, vec![Some(tf)]);
    }

    #[test]
    fn exactly_one_environment_runs_after_dispatch() {
        let mut kernel = test_kernel();
        let (a, base_a) = running_env(&mut kernel);
        let (b, base_b) = running_env(&mut kernel);
        assert_eq!(kernel.pool.current_id(), b);

        let mut tf = user_trap(&base_b, T_SYSCALL);
        tf.regs.rax = crate::syscall::SYS_YIELD;
        let next = kernel.dispatch_trap(&tf).unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), a);
        assert_eq!(next.rip, base_a.rip);
        assert_eq!(kernel.pool.running_count(), 1);
        assert_eq!(kernel.pool.lookup(b, false).unwrap().status, EnvStatus::Runnable);

        let mut tf = user_trap(&base_a, T_SYSCALL);
        tf.regs.rax = crate::syscall::SYS_YIELD;
        let next = kernel.dispatch_trap(&tf).unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), b);
        assert_eq!(next.rip, base_b.rip + 2);
        assert_eq!(next.regs.rax, 0);
        assert_eq!(next.rflags & RFLAGS_IF, 0);
        assert_eq!(kernel.pool.running_count(), 1);

        let env = kernel.pool.current().unwrap();
        assert_eq!(kernel.machine.active_root(), env.address_space.as_ref().unwrap().root());
    }
}
