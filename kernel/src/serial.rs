// Serial Port Driver (Kernel Debug I/O)
//
// Minimal output-only driver for the legacy COM1 UART (0x3F8). It backs the
// logging macros and the debugger prompt.
//
// Implementation details:
// - Port I/O through `x86_64::instructions::port::Port`
// - UART is configured for 38400 baud (divisor = 3), 8N1, FIFO enabled
// - Transmit holding register is polled before each byte
// - Newlines are normalized to CRLF for terminal compatibility
//
// Concurrency and safety:
// - Global `SERIAL1` is protected by a spinlock
// - `_print` masks interrupts only for its own duration and restores the
//   previous state, so trap handlers that run with IF clear stay that way
//
// Hosted builds (unit tests) have no UART; `_print` forwards to stdout.

use core::fmt;

#[cfg(target_os = "none")]
mod uart {
    use core::fmt;
    use x86_64::instructions::port::Port;

    pub const COM1: u16 = 0x3F8;

    pub struct SerialPort {
        data: Port<u8>,
        int_enable: Port<u8>,
        fifo_ctrl: Port<u8>,
        line_ctrl: Port<u8>,
        modem_ctrl: Port<u8>,
        line_status: Port<u8>,
    }

    impl SerialPort {
        pub const fn new(base: u16) -> Self {
            SerialPort {
                data: Port::new(base),
                int_enable: Port::new(base + 1),
                fifo_ctrl: Port::new(base + 2),
                line_ctrl: Port::new(base + 3),
                modem_ctrl: Port::new(base + 4),
                line_status: Port::new(base + 5),
            }
        }

        pub fn init(&mut self) {
            unsafe {
                self.int_enable.write(0x00);
                self.line_ctrl.write(0x80);
                self.data.write(0x03);
                self.int_enable.write(0x00);
                self.line_ctrl.write(0x03);
                self.fifo_ctrl.write(0xC7);
                self.modem_ctrl.write(0x0B);
            }
        }

        fn is_transmit_empty(&mut self) -> bool {
            unsafe { self.line_status.read() & 0x20 != 0 }
        }

        pub fn write_byte(&mut self, byte: u8) {
            while !self.is_transmit_empty() {
                core::hint::spin_loop();
            }
            unsafe {
                self.data.write(byte);
            }
        }
    }

    impl fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.write_byte(b'\r');
                }
                self.write_byte(byte);
            }
            Ok(())
        }
    }

    pub static SERIAL1: spin::Mutex<SerialPort> = spin::Mutex::new(SerialPort::new(COM1));
}

#[cfg(target_os = "none")]
pub fn init() {
    uart::SERIAL1.lock().init();
}

#[cfg(target_os = "none")]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        // The UART never reports a write error; a formatting error only
        // truncates this line.
        let _ = uart::SERIAL1.lock().write_fmt(args);
    });
}

#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
