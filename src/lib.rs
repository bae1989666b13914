// Unit tests run on the host, so only the kernel build drops std.
#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod allocator;
pub mod apic;
pub mod bringup;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod gdt;
pub mod interrupts;
pub mod log;
pub mod memory;
pub mod pci;
pub mod serial;
pub mod usb;

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
