// Kernel Context
//
// `Kernel` is the one process-wide context: the machine, the debug monitor,
// the environment pool and the boot translation root. Every operation that
// touches more than one of those takes `&mut Kernel`.
//
// Key responsibilities:
// - Record the boot root that every address space copies its kernel half from
// - Create environments from executable images and destroy them
// - Enforce user-buffer checks on behalf of the system-call layer
// - Render fatal errors: dump state, log at panic level, enter the monitor
//
// Design principles:
// - Errors are values; each layer's error converts into `KernelError`, and
//   only the two entry points (`kmain` and the trap entry) halt on one
// - On bare metal the single instance lives in `KERNEL`, a `spin::Mutex`
//   built in a const context, so nothing is initialised lazily
// - Scheduling lives in `sched`, trap dispatch in `interrupts::handlers`;
//   both are further `impl` blocks on this type
//
// Correctness and safety notes:
// - Nothing may create environments before `init` has recorded the root
// - The trap entry takes the lock with `try_lock`; failing to get it means
//   a trap arrived while the kernel was already dispatching one

use core::fmt;

use x86_64::structures::paging::{PageTableFlags, PhysFrame};

use crate::arch::Machine;
use crate::env::{EnvError, EnvId, EnvPool, EnvType};
use crate::executable::{self, LoadError};
use crate::interrupts::trap::{self, TrapFrame};
use crate::log::LogLevel;
use crate::mm::MemoryError;
use crate::monitor::Monitor;
use crate::{log_error, log_info, log_panic};

const LOG_ORIGIN: &str = "kernel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Memory(MemoryError),
    Env(EnvError),
    Load(LoadError),
    KernelModeFault { va: u64, rip: u64 },
    UnhandledTrap(u64),
    InterruptsEnabled,
    ReentrantTrap,
    NoCurrentEnvironment,
    NoAddressSpace(EnvId),
    NotInitialized,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Memory(err) => write!(f, "{}", err),
            KernelError::Env(err) => write!(f, "{}", err),
            KernelError::Load(err) => write!(f, "{}", err),
            KernelError::KernelModeFault { va, rip } => {
                write!(f, "kernel-mode page fault at va {:#x}, rip {:#x}", va, rip)
            }
            KernelError::UnhandledTrap(n) => {
                write!(f, "unhandled trap {} ({}) in kernel", n, trap::trap_name(*n))
            }
            KernelError::InterruptsEnabled => f.write_str("trap taken with interrupts enabled"),
            KernelError::ReentrantTrap => f.write_str("trap taken while dispatching a trap"),
            KernelError::NoCurrentEnvironment => {
                f.write_str("user-mode trap with no current environment")
            }
            KernelError::NoAddressSpace(id) => write!(f, "env {} has no address space", id),
            KernelError::NotInitialized => f.write_str("kernel root not recorded"),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        KernelError::Memory(err)
    }
}

impl From<EnvError> for KernelError {
    fn from(err: EnvError) -> Self {
        KernelError::Env(err)
    }
}

impl From<LoadError> for KernelError {
    fn from(err: LoadError) -> Self {
        KernelError::Load(err)
    }
}

pub struct Kernel<M: Machine, D: Monitor, const N: usize> {
    pub(crate) machine: M,
    pub(crate) monitor: D,
    pub(crate) pool: EnvPool<N>,
    kernel_root: Option<PhysFrame>,
}

impl<M: Machine, D: Monitor, const N: usize> Kernel<M, D, N> {
    pub const fn new(machine: M, monitor: D) -> Self {
        Self {
            machine,
            monitor,
            pool: EnvPool::new(),
            kernel_root: None,
        }
    }

    /// Record the boot hierarchy. Its kernel half must be final: address
    /// spaces copy it once and never look again.
    pub fn init(&mut self, kernel_root: PhysFrame) {
        self.kernel_root = Some(kernel_root);
        log_info!(
            LOG_ORIGIN,
            "Environment pool ready: {} slots, kernel root {:#x}",
            self.pool.capacity(),
            kernel_root.start_address().as_u64()
        );
    }

    pub fn kernel_root(&self) -> Result<PhysFrame, KernelError> {
        self.kernel_root.ok_or(KernelError::NotInitialized)
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Allocate an empty environment with `parent` as its parent id.
    pub fn alloc_env(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        let root = self.kernel_root()?;
        let env = self.pool.allocate(&mut self.machine, root, parent)?;
        Ok(env.id)
    }

    /// Allocate an environment and load `image` into it. Created by the
    /// kernel, so the parent id is 0. A failed load releases the record
    /// again before the error is returned.
    pub fn create(&mut self, image: &[u8], env_type: EnvType) -> Result<EnvId, KernelError> {
        let root = self.kernel_root()?;
        let env = self.pool.allocate(&mut self.machine, root, EnvId::CURRENT)?;
        env.env_type = env_type;
        let id = env.id;

        if let Err(err) = executable::load(&mut self.machine, root, env, image) {
            self.pool.release(&mut self.machine, root, id)?;
            return Err(err.into());
        }
        Ok(id)
    }

    /// Release `id`. When it was the running environment the kernel root is
    /// active afterwards and nothing is current until the next schedule.
    pub fn destroy(&mut self, id: EnvId) -> Result<(), KernelError> {
        let root = self.kernel_root()?;
        self.pool.release(&mut self.machine, root, id)?;
        Ok(())
    }

    /// Check a user range against the current environment's address space.
    /// On failure the environment is destroyed and `false` is returned.
    pub fn user_mem_assert(&mut self, va: u64, len: usize, perm: PageTableFlags) -> bool {
        let Some(env) = self.pool.current() else {
            return false;
        };
        let id = env.id;

        let check = match env.address_space.as_ref() {
            Some(space) => space.user_mem_check(&self.machine, va, len, perm),
            None => Err(crate::mm::addrspace::BadUserAccess { va }),
        };

        match check {
            Ok(()) => true,
            Err(bad) => {
                log_info!(
                    LOG_ORIGIN,
                    "[{:08x}] user_mem_check assertion failure for va {:08x}",
                    id,
                    bad.va
                );
                if let Err(err) = self.destroy(id) {
                    log_error!(LOG_ORIGIN, "destroying {} after bad access: {}", id, err);
                }
                false
            }
        }
    }

    /// Everything a fatal error does short of halting: dump the frame (or
    /// the current environment's saved one), log at panic level and hand the
    /// monitor the frame.
    pub fn report_fatal(&mut self, err: &KernelError, frame: Option<&TrapFrame>) {
        let saved = self.pool.current().map(|env| env.saved_frame);
        let frame = frame.or(saved.as_ref());

        if let Some(frame) = frame {
            let fault_va = match err {
                KernelError::KernelModeFault { .. } => Some(self.machine.fault_address()),
                _ => None,
            };
            trap::dump(LogLevel::Panic, frame, fault_va);
        }
        log_panic!(LOG_ORIGIN, "fatal: {}", err);
        self.monitor.enter(frame);
    }
}

#[cfg(target_os = "none")]
pub use self::global::{KernelContext, KERNEL};

#[cfg(target_os = "none")]
mod global {
    use spin::Mutex;

    use super::Kernel;
    use crate::arch::X86Machine;
    use crate::env::NENV;
    use crate::monitor::SerialMonitor;

    pub type KernelContext = Kernel<X86Machine, SerialMonitor, NENV>;

    pub static KERNEL: Mutex<KernelContext> =
        Mutex::new(Kernel::new(X86Machine::new(), SerialMonitor::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Cpu;
    use crate::env::EnvStatus;
    use crate::executable::ImageDefect;
    use crate::mm::FrameAllocator;
    use crate::testing::{test_kernel, ElfBuilder, RecordingMonitor, SimMachine};

    #[test]
    fn nothing_is_created_before_init() {
        let mut kernel: Kernel<SimMachine, RecordingMonitor, 4> =
            Kernel::new(SimMachine::new(), RecordingMonitor::default());
        assert_eq!(
            kernel.alloc_env(EnvId::CURRENT),
            Err(KernelError::NotInitialized)
        );
    }

    #[test]
    fn create_loads_and_leaves_the_record_runnable() {
        let mut kernel = test_kernel();
        let image = ElfBuilder::new(0x80_0020).segment(0x80_0000, &[0xCC; 48], 64).build();

        let id = kernel.create(&image, EnvType::User).unwrap();
        let env = kernel.pool.lookup(id, false).unwrap();
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!(env.parent_id, EnvId::CURRENT);
        assert_eq!(env.saved_frame.rip, 0x80_0020);
        assert_eq!(kernel.machine.active_root(), kernel.kernel_root().unwrap());
    }

    #[test]
    fn failed_create_gives_everything_back() {
        let mut kernel = test_kernel();
        let free_frames = kernel.machine.free_frames();
        let free_slots = kernel.pool.free_count();
        let bad = ElfBuilder::new(0).segment(0x1000, &[0; 8], 4).build();

        assert_eq!(
            kernel.create(&bad, EnvType::User),
            Err(KernelError::Load(LoadError::MalformedImage(
                ImageDefect::FileSizeExceedsMemSize
            )))
        );
        assert_eq!(kernel.machine.free_frames(), free_frames);
        assert_eq!(kernel.pool.free_count(), free_slots);
    }

    #[test]
    fn pool_exhaustion_surfaces_as_env_error() {
        let mut kernel = test_kernel();
        for _ in 0..kernel.pool.capacity() {
            kernel.alloc_env(EnvId::CURRENT).unwrap();
        }
        assert_eq!(
            kernel.alloc_env(EnvId::CURRENT),
            Err(KernelError::Env(EnvError::PoolExhausted))
        );
    }

    #[test]
    fn fatal_report_enters_the_monitor_with_the_frame() {
        let mut kernel = test_kernel();
        let frame = TrapFrame::zero();
        kernel.report_fatal(&KernelError::UnhandledTrap(13), Some(&frame));
        kernel.report_fatal(&KernelError::NotInitialized, None);
        assert_eq!(kernel.monitor.entries, vec![Some(frame), None]);
    }

    #[test]
    fn errors_render_readably() {
        let err = KernelError::KernelModeFault { va: 0x10, rip: 0xffff_8000_0000_1000 };
        assert!(err.to_string().contains("0x10"));
        assert!(KernelError::UnhandledTrap(13).to_string().contains("General Protection"));
        assert_eq!(
            KernelError::from(EnvError::PoolExhausted),
            KernelError::Env(EnvError::PoolExhausted)
        );
    }
}
