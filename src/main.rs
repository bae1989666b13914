// freestanding: no std, and no C runtime to call `main`
#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use bringup_os::log::LogLevel;
use bringup_os::{bringup, hlt_loop, log};

// `entry_point` type-checks the signature and exports it as `_start`
entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    bringup::run(boot_info)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log!(LogLevel::Error, "{}", info);
    hlt_loop();
}
