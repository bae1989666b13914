use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

// COM1
const SERIAL_IO_PORT: u16 = 0x3F8;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

// Task-context writers mask interrupts while they hold the port lock, so an interrupt can never
// arrive while the lock is held by the code it preempted.
#[cfg(not(test))]
#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

// host unit tests have no COM1; route the sink to stdout
#[cfg(test)]
#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    std::print!("{}", args);
}
