// Environment Scheduler and Context Switch
//
// Cooperative round-robin over the environment pool. There is no timer:
// the CPU changes hands only when the running environment yields, exits or
// is destroyed by a fault.
//
// Key responsibilities:
// - Pick the environment to resume after every trap
// - Perform the bookkeeping half of a context switch (status, run count,
//   translation root) and hand back the frame to restore
// - Restore a frame on the CPU and drop to ring 3 (bare metal only)
//
// Scheduling model:
// - A `Running` current environment keeps the CPU
// - Otherwise the first `Runnable` record after the current slot runs,
//   wrapping around; a yielding environment is only picked again when
//   nobody else is runnable
// - With nothing runnable the kernel reports it, enters the monitor and
//   idles
//
// Implementation details:
// - `switch_to` is separate from the register restore so the state change
//   can be exercised on the host; `run` is the never-returning pair of both
// - The frame returned is a copy; the kernel lock must be dropped before
//   it is popped

use crate::arch::Machine;
use crate::env::{EnvId, EnvStatus};
use crate::interrupts::trap::TrapFrame;
use crate::monitor::Monitor;
use crate::system::{Kernel, KernelError};
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "sched";

impl<M: Machine, D: Monitor, const N: usize> Kernel<M, D, N> {
    /// Make `id` the running environment and install its translation root.
    /// Returns the register state it resumes with.
    pub fn switch_to(&mut self, id: EnvId) -> Result<TrapFrame, KernelError> {
        let env = self.pool.activate(id)?;
        let root = env
            .address_space
            .as_ref()
            .map(|space| space.root())
            .ok_or(KernelError::NoAddressSpace(env.id))?;

        // SAFETY: every environment root carries the kernel half, so the
        // kernel keeps running after the switch.
        unsafe { self.machine.switch_root(root) };

        log_debug!(
            LOG_ORIGIN,
            "run env {} (runs={}) rip={:#x} rsp={:#x}",
            env.id,
            env.runs,
            env.saved_frame.rip,
            env.saved_frame.rsp
        );
        Ok(env.saved_frame)
    }

    /// Give up the CPU on behalf of the current environment. It stays
    /// runnable and is picked again only if nothing else is.
    pub fn yield_current(&mut self) {
        if let Some(env) = self.pool.current_mut() {
            if env.status == EnvStatus::Running {
                env.status = EnvStatus::Runnable;
            }
        }
    }

    /// Choose what runs next and switch to it. `None` means no environment
    /// is left; the monitor has already been entered.
    pub fn schedule(&mut self) -> Result<Option<TrapFrame>, KernelError> {
        let keep = self
            .pool
            .current()
            .filter(|env| env.status == EnvStatus::Running)
            .map(|env| env.id);

        match keep.or_else(|| self.pool.next_runnable()) {
            Some(id) => {
                let frame = self.switch_to(id)?;
                debug_assert_eq!(self.pool.running_count(), 1);
                Ok(Some(frame))
            }
            None => {
                log_info!(LOG_ORIGIN, "Destroyed the only environment - nothing more to do!");
                self.monitor.enter(None);
                Ok(None)
            }
        }
    }
}

/// Restore `frame` on the CPU. Never returns.
#[cfg(target_os = "none")]
pub fn run(frame: &TrapFrame) -> ! {
    // SAFETY: frames come from `switch_to`, whose root is now active, or
    // from the trap entry itself.
    unsafe { crate::arch::entry::pop_trap_frame(frame) }
}

#[cfg(test)]
mod tests {
    use crate::arch::Cpu;
    use crate::env::{EnvId, EnvStatus};
    use crate::mm::USTACKTOP;
    use crate::system::KernelError;
    use crate::testing::{test_kernel, ElfBuilder};

    #[test]
    fn switch_to_hands_back_the_entry_frame() {
        let mut kernel = test_kernel();
        let image = ElfBuilder::new(0x80_0040).segment(0x80_0000, &[0x90; 0x80], 0x80).build();
        let id = kernel.create(&image, crate::env::EnvType::User).unwrap();

        let frame = kernel.switch_to(id).unwrap();
        assert_eq!(frame.rip, 0x80_0040);
        assert_eq!(frame.rsp, USTACKTOP);
        assert!(frame.from_user());

        let env = kernel.pool.lookup(id, false).unwrap();
        assert_eq!(env.status, EnvStatus::Running);
        assert_eq!(env.runs, 1);
        assert_eq!(
            kernel.machine.active_root(),
            env.address_space.as_ref().unwrap().root()
        );
    }

    #[test]
    fn running_environment_keeps_the_cpu() {
        let mut kernel = test_kernel();
        let a = kernel.alloc_env(EnvId::CURRENT).unwrap();
        let _b = kernel.alloc_env(EnvId::CURRENT).unwrap();
        kernel.switch_to(a).unwrap();

        kernel.schedule().unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), a);
        assert_eq!(kernel.pool.running_count(), 1);
    }

    #[test]
    fn next_runnable_takes_over_after_exit() {
        let mut kernel = test_kernel();
        let a = kernel.alloc_env(EnvId::CURRENT).unwrap();
        let b = kernel.alloc_env(EnvId::CURRENT).unwrap();
        kernel.switch_to(a).unwrap();

        kernel.destroy(a).unwrap();
        assert_eq!(kernel.machine.active_root(), kernel.kernel_root().unwrap());

        kernel.schedule().unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), b);
        assert!(kernel.monitor.entries.is_empty());
    }

    #[test]
    fn scan_after_exit_resumes_past_the_released_slot() {
        let mut kernel = test_kernel();
        let a = kernel.alloc_env(EnvId::CURRENT).unwrap();
        let b = kernel.alloc_env(EnvId::CURRENT).unwrap();
        let c = kernel.alloc_env(EnvId::CURRENT).unwrap();
        kernel.switch_to(b).unwrap();

        kernel.destroy(b).unwrap();
        kernel.schedule().unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), c);

        // Slot order wraps back to the front once the tail is exhausted.
        kernel.destroy(c).unwrap();
        kernel.schedule().unwrap().unwrap();
        assert_eq!(kernel.pool.current_id(), a);
        assert_eq!(kernel.pool.running_count(), 1);
    }

    #[test]
    fn idle_when_nothing_is_left() {
        let mut kernel = test_kernel();
        let a = kernel.alloc_env(EnvId::CURRENT).unwrap();
        kernel.switch_to(a).unwrap();
        kernel.destroy(a).unwrap();

        assert_eq!(kernel.schedule(), Ok(None));
        assert_eq!(kernel.monitor.entries, vec![None]);
    }

    #[test]
    fn switching_to_a_stale_id_fails() {
        let mut kernel = test_kernel();
        let a = kernel.alloc_env(EnvId::CURRENT).unwrap();
        kernel.destroy(a).unwrap();
        assert_eq!(
            kernel.switch_to(a),
            Err(KernelError::Env(crate::env::EnvError::UnknownEnvironment))
        );
    }
}
