/**
 * In-memory configuration space for unit tests.
 */

use std::collections::BTreeMap;
use std::vec::Vec;

use super::{ClassCode, ConfigSpace, REG_BUS_NUMBERS, REG_CLASS_CODE, REG_HEADER_TYPE};

pub type Address = (u8, u8, u8);

#[derive(Clone)]
pub struct FakeFunction {
    regs: [u32; 64],
}

impl FakeFunction {
    pub fn new(vendor_id: u16, device_id: u16, class_code: ClassCode) -> Self {
        let mut regs = [0; 64];
        regs[0] = vendor_id as u32 | ((device_id as u32) << 16);
        regs[(REG_CLASS_CODE / 4) as usize] = ((class_code.base as u32) << 24)
            | ((class_code.sub as u32) << 16)
            | ((class_code.interface as u32) << 8);
        FakeFunction { regs }
    }

    pub fn header_type(mut self, header_type: u8) -> Self {
        let idx = (REG_HEADER_TYPE / 4) as usize;
        self.regs[idx] = (self.regs[idx] & !0x00ff_0000) | ((header_type as u32) << 16);
        self
    }

    pub fn multi_function(self) -> Self {
        let header_type = self.header_type_value() | 0x80;
        self.header_type(header_type)
    }

    // A PCI-to-PCI bridge forwarding to `secondary`.
    pub fn bridge(vendor_id: u16, primary: u8, secondary: u8) -> Self {
        let mut function = FakeFunction::new(vendor_id, 0x0001, ClassCode::new(0x06, 0x04, 0x00))
            .header_type(0x01);
        function.regs[(REG_BUS_NUMBERS / 4) as usize] =
            primary as u32 | ((secondary as u32) << 8) | ((secondary as u32) << 16);
        function
    }

    pub fn reg(mut self, reg: u8, value: u32) -> Self {
        self.regs[(reg / 4) as usize] = value;
        self
    }

    fn header_type_value(&self) -> u8 {
        (self.regs[(REG_HEADER_TYPE / 4) as usize] >> 16) as u8
    }
}

#[derive(Default)]
pub struct FakeConfigSpace {
    functions: BTreeMap<Address, FakeFunction>,
    reads: BTreeMap<Address, usize>,
    pub writes: Vec<(Address, u8, u32)>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bus: u8, device: u8, function: u8, f: FakeFunction) -> &mut Self {
        self.functions.insert((bus, device, function), f);
        self
    }

    pub fn reg(&self, address: Address, reg: u8) -> u32 {
        self.functions
            .get(&address)
            .map_or(0xffff_ffff, |f| f.regs[(reg / 4) as usize])
    }

    pub fn reads_of(&self, address: Address) -> usize {
        self.reads.get(&address).copied().unwrap_or(0)
    }

    pub fn writes_to(&self, address: Address) -> Vec<(u8, u32)> {
        self.writes
            .iter()
            .filter(|(a, _, _)| *a == address)
            .map(|(_, reg, value)| (*reg, *value))
            .collect()
    }
}

impl ConfigSpace for FakeConfigSpace {
    fn read_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8) -> u32 {
        *self.reads.entry((bus, device, function)).or_insert(0) += 1;
        self.reg((bus, device, function), reg)
    }

    fn write_u32(&mut self, bus: u8, device: u8, function: u8, reg: u8, value: u32) {
        self.writes.push(((bus, device, function), reg & 0xfc, value));
        if let Some(f) = self.functions.get_mut(&(bus, device, function)) {
            f.regs[(reg / 4) as usize] = value;
        }
    }
}
