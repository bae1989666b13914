/**
 * PCI configuration space access, device records and BAR decoding.
 *
 * Configuration space is reached through the legacy type-1 mechanism: write the target
 * address to `CONFIG_ADDRESS` (0xCF8), then access `CONFIG_DATA` (0xCFC). The two accesses
 * must not be interleaved with another caller's pair. Enumeration and MSI setup run before
 * interrupts are enabled and through a single `&mut` owner, which keeps every pair intact.
 */

pub mod handoff;
pub mod msi;
pub mod scan;
#[cfg(test)]
pub(crate) mod testing;

use x86_64::instructions::port::Port;

use crate::error::{ErrorKind, Result};
use crate::make_error;

pub use handoff::switch_ehci_to_xhci;
pub use msi::{
    capabilities, configure_msi, configure_msi_fixed_destination, find_msi_capability,
    Capability, MsiCapability, MsiDeliveryMode, MsiTriggerMode,
};
pub use scan::{scan_all_buses, Inventory, DEVICE_CAPACITY};

pub const CONFIG_ADDRESS: u16 = 0xcf8;
pub const CONFIG_DATA: u16 = 0xcfc;

// Vendor ID read back from an address with no function behind it.
pub const VENDOR_ID_ABSENT: u16 = 0xffff;
pub const VENDOR_INTEL: u16 = 0x8086;

pub const REG_VENDOR_DEVICE: u8 = 0x00;
pub const REG_CLASS_CODE: u8 = 0x08;
pub const REG_HEADER_TYPE: u8 = 0x0c;
pub const REG_BAR0: u8 = 0x10;
pub const REG_BUS_NUMBERS: u8 = 0x18;
pub const REG_CAPABILITY_POINTER: u8 = 0x34;

pub const HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;
pub const MAX_BARS: u8 = 6;

const BAR_MEMORY_TYPE_MASK: u32 = 0b110;
const BAR_MEMORY_TYPE_64: u32 = 0b100;

// Builds the 32-bit value written to `CONFIG_ADDRESS`.
pub const fn make_address(bus: u8, device: u8, function: u8, reg: u8) -> u32 {
    (1 << 31)
        | ((bus as u32) << 16)
        | (((device & 0x1f) as u32) << 11)
        | (((function & 0x7) as u32) << 8)
        | (reg as u32 & 0xfc)
}

pub const fn is_single_function_device(header_type: u8) -> bool {
    header_type & HEADER_TYPE_MULTI_FUNCTION == 0
}

// Access to 32-bit configuration registers. `reg` is a byte offset; the low two bits are
// ignored.
pub trait ConfigSpace {
    fn read_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8) -> u32;
    fn write_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8, value: u32);

    fn read_vendor_id(&mut self, bus: u8, device: u8, function: u8) -> u16 {
        (self.read_u32(bus, device, function, REG_VENDOR_DEVICE) & 0xffff) as u16
    }

    fn read_device_id(&mut self, bus: u8, device: u8, function: u8) -> u16 {
        (self.read_u32(bus, device, function, REG_VENDOR_DEVICE) >> 16) as u16
    }

    fn read_header_type(&mut self, bus: u8, device: u8, function: u8) -> u8 {
        ((self.read_u32(bus, device, function, REG_HEADER_TYPE) >> 16) & 0xff) as u8
    }

    fn read_class_code(&mut self, bus: u8, device: u8, function: u8) -> ClassCode {
        let reg = self.read_u32(bus, device, function, REG_CLASS_CODE);
        ClassCode {
            base: (reg >> 24) as u8,
            sub: ((reg >> 16) & 0xff) as u8,
            interface: ((reg >> 8) & 0xff) as u8,
        }
    }

    // primary (7:0), secondary (15:8) and subordinate (23:16) bus numbers of a bridge
    fn read_bus_numbers(&mut self, bus: u8, device: u8, function: u8) -> u32 {
        self.read_u32(bus, device, function, REG_BUS_NUMBERS)
    }

    fn read_conf_reg(&mut self, dev: &Device, reg: u8) -> u32 {
        self.read_u32(dev.bus, dev.device, dev.function, reg)
    }

    fn write_conf_reg(&mut self, dev: &Device, reg: u8, value: u32) {
        self.write_u32(dev.bus, dev.device, dev.function, reg, value)
    }
}

// Configuration space through the 0xCF8/0xCFC I/O ports.
pub struct PortConfigSpace {
    address: Port<u32>,
    data: Port<u32>,
}

impl PortConfigSpace {
    // Safety: at most one instance may be in use, and never concurrently with an interrupt
    // handler that touches configuration space.
    pub const unsafe fn new() -> Self {
        PortConfigSpace {
            address: Port::new(CONFIG_ADDRESS),
            data: Port::new(CONFIG_DATA),
        }
    }
}

impl ConfigSpace for PortConfigSpace {
    fn read_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8) -> u32 {
        unsafe {
            self.address.write(make_address(bus, device, function, reg));
            self.data.read()
        }
    }

    fn write_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8, value: u32) {
        unsafe {
            self.address.write(make_address(bus, device, function, reg));
            self.data.write(value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassCode {
    pub base: u8,
    pub sub: u8,
    pub interface: u8,
}

impl ClassCode {
    pub const fn new(base: u8, sub: u8, interface: u8) -> Self {
        ClassCode {
            base,
            sub,
            interface,
        }
    }

    pub fn matches_base(&self, base: u8) -> bool {
        self.base == base
    }

    pub fn matches_sub(&self, base: u8, sub: u8) -> bool {
        self.matches_base(base) && self.sub == sub
    }

    pub fn matches(&self, base: u8, sub: u8, interface: u8) -> bool {
        self.matches_sub(base, sub) && self.interface == interface
    }

    pub fn is_pci_bridge(&self) -> bool {
        self.matches_sub(0x06, 0x04)
    }

    pub fn is_xhci(&self) -> bool {
        self.matches(0x0c, 0x03, 0x30)
    }

    pub fn is_ehci(&self) -> bool {
        self.matches(0x0c, 0x03, 0x20)
    }
}

// One discovered function. Identity is the (bus, device, function) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub header_type: u8,
    pub class_code: ClassCode,
}

impl Device {
    pub const EMPTY: Device = Device {
        bus: 0,
        device: 0,
        function: 0,
        header_type: 0,
        class_code: ClassCode::new(0, 0, 0),
    };

    pub fn address(&self) -> (u8, u8, u8) {
        (self.bus, self.device, self.function)
    }

    pub fn vendor_id(&self, cfg: &mut impl ConfigSpace) -> u16 {
        cfg.read_vendor_id(self.bus, self.device, self.function)
    }
}

// Reads BAR `bar_index`. A 64-bit memory BAR is combined with the following register into one
// address; the flag bits in the low nibble are returned as read.
pub fn read_bar(cfg: &mut impl ConfigSpace, device: &Device, bar_index: u8) -> Result<u64> {
    if bar_index >= MAX_BARS {
        return Err(make_error!(ErrorKind::IndexOutOfRange));
    }

    let reg = REG_BAR0 + 4 * bar_index;
    let bar = cfg.read_conf_reg(device, reg);

    // 32 bit address
    if bar & BAR_MEMORY_TYPE_MASK != BAR_MEMORY_TYPE_64 {
        return Ok(bar as u64);
    }

    // 64 bit address
    if bar_index >= MAX_BARS - 1 {
        return Err(make_error!(ErrorKind::IndexOutOfRange));
    }
    let bar_upper = cfg.read_conf_reg(device, reg + 4);
    Ok(bar as u64 | ((bar_upper as u64) << 32))
}
