// Kernel Debug Monitor
//
// The sink the dispatcher hands control to on a breakpoint, on a fatal
// error and when no environment is left to run.
//
// The monitor is a trait so the dispatcher can be driven with a recording
// double on the host. The serial implementation is non-interactive: it
// prints a banner, the build identity and the trap frame it was given, then
// returns to the caller, which either resumes the environment or halts.

use crate::build_info::{KERNEL_NAME, VERSION_TAG};
use crate::interrupts::trap::{self, TrapFrame};
use crate::log::LogLevel;
use crate::serial_println;

pub trait Monitor {
    /// Called with the trapping frame, or `None` when there is no
    /// environment context (idle, or a fatal error outside any trap).
    fn enter(&mut self, frame: Option<&TrapFrame>);
}

pub struct SerialMonitor {
    entries: u64,
}

impl SerialMonitor {
    pub const fn new() -> Self {
        Self { entries: 0 }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }
}

impl Monitor for SerialMonitor {
    fn enter(&mut self, frame: Option<&TrapFrame>) {
        self.entries += 1;

        serial_println!("Welcome to the {} monitor ({})", KERNEL_NAME, VERSION_TAG);
        match frame {
            Some(frame) => trap::dump(LogLevel::Info, frame, None),
            None => serial_println!("No environment context."),
        }
        serial_println!("Leaving monitor (entry #{}).", self.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_monitor_counts_entries() {
        let mut monitor = SerialMonitor::new();
        monitor.enter(None);
        monitor.enter(Some(&TrapFrame::new_user(0x1000)));
        assert_eq!(monitor.entries(), 2);
    }
}
