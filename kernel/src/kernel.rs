// Kernel entry point and system initialization
//
// This file is the crate root. It declares the subsystems and, on bare
// metal, defines `kmain`: the function the boot stub jumps to once it has
// built the boot page tables and filled a `BootInfo`.
//
// Key responsibilities:
// - Bring up the serial console and logging first
// - Install the GDT/TSS and the IDT before anything can trap
// - Hand the physical memory map to the frame table
// - Record the boot root as the kernel-half template
// - Create the first environment from the boot payload and run it
//
// Design and implementation:
// - The kernel is `no_std`/`no_main` only when built for `target_os =
//   "none"`; on a hosted target the same modules build against std so the
//   environment, loader and dispatch logic run under `cargo test`
// - Initialization follows a strict, explicit ordering
// - Interrupts are never enabled; the only ways back into the kernel are
//   exceptions and the system-call gate
// - Errors during boot go through the same fatal path as trap errors:
//   report, monitor, halt
//
// Safety and correctness notes:
// - Boot-provided structures are treated as immutable
// - The kernel lock is released before the first environment's frame is
//   popped; the trap entry takes it again
// - The panic handler halts the CPU to avoid undefined behavior
//
// Limitations:
// - Single core, no timer, no preemption
// - Exactly one environment is created at boot

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

pub mod arch;
pub mod boot;
pub mod build_info;
pub mod env;
pub mod executable;
pub mod interrupts;
pub mod log;
pub mod mm;
pub mod monitor;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod system;

#[cfg(test)]
mod testing;

#[cfg(target_os = "none")]
pub use self::bare_metal::kmain;

#[cfg(target_os = "none")]
mod bare_metal {
    use core::panic::PanicInfo;

    use x86_64::registers::control::Cr3;

    use crate::arch::{gdt, halt_forever};
    use crate::boot::BootInfo;
    use crate::env::EnvType;
    use crate::interrupts::trap::TrapFrame;
    use crate::log::{self, LogLevel};
    use crate::system::{KernelContext, KernelError, KERNEL};
    use crate::{build_info, interrupts, sched, serial};
    use crate::{log_info, log_panic, log_warn};

    const LOG_KERNEL_INIT: &str = "kernel:init";

    const KERNEL_STACK_SIZE: usize = 4096 * 4;

    #[repr(align(16))]
    struct AlignedStack([u8; KERNEL_STACK_SIZE]);

    /// Stack every trap from ring 3 starts on (TSS.rsp0).
    static mut KERNEL_STACK: AlignedStack = AlignedStack([0; KERNEL_STACK_SIZE]);

    fn kernel_stack_top() -> u64 {
        core::ptr::addr_of!(KERNEL_STACK) as u64 + KERNEL_STACK_SIZE as u64
    }

    #[no_mangle]
    pub extern "C" fn kmain(boot_info: &'static BootInfo) -> ! {
        serial::init();
        if boot_info.verbose {
            log::set_level(LogLevel::Debug);
        }

        log_info!(LOG_KERNEL_INIT, "{}", build_info::BOOT_BANNER);
        log_info!(LOG_KERNEL_INIT, "Boot method: {:?}", boot_info.boot_method);

        gdt::init(kernel_stack_top());
        interrupts::init();

        let first = {
            let mut kernel = KERNEL.lock();
            match start(&mut kernel, boot_info) {
                Ok(first) => first,
                Err(err) => {
                    kernel.report_fatal(&err, None);
                    None
                }
            }
        };

        match first {
            Some(frame) => {
                log_info!(LOG_KERNEL_INIT, "Entering first environment at {:#x}", frame.rip);
                sched::run(&frame)
            }
            None => halt_forever(),
        }
    }

    fn start(
        kernel: &mut KernelContext,
        boot_info: &'static BootInfo,
    ) -> Result<Option<TrapFrame>, KernelError> {
        kernel.machine_mut().add_memory_map(&boot_info.memory_map);

        let (root, _) = Cr3::read();
        kernel.init(root);

        if boot_info.init_image.is_present() {
            // SAFETY: the boot stub keeps the payload mapped for the life of
            // the kernel.
            let image = unsafe { boot_info.init_image.as_bytes() };
            let id = kernel.create(image, EnvType::User)?;
            log_info!(LOG_KERNEL_INIT, "init environment {} created", id);
        } else {
            log_warn!(LOG_KERNEL_INIT, "No init image in the boot payload");
        }

        kernel.schedule()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        log_panic!("PANIC", "{}", info);
        halt_forever()
    }
}
