/**
 * Depth-first PCI enumeration.
 *
 * The walk keeps its own stack of bus cursors instead of recursing, so bridge nesting costs
 * no kernel stack. A bridge's secondary bus is pushed right after the bridge is recorded and
 * is scanned to completion before the parent cursor moves on, which keeps every subtree
 * contiguous in the inventory.
 */

use super::{is_single_function_device, ConfigSpace, Device, VENDOR_ID_ABSENT};
use crate::error::{ErrorKind, Result};
use crate::make_error;

// Maximum number of functions recorded by one scan.
pub const DEVICE_CAPACITY: usize = 32;

const DEVICES_PER_BUS: u8 = 32;
const FUNCTIONS_PER_DEVICE: u8 = 8;

// Every nested bus is entered through a recorded bridge, so nesting never exceeds the
// inventory capacity plus the root bus.
const MAX_SCAN_DEPTH: usize = DEVICE_CAPACITY + 1;

// Fixed-capacity list of discovered functions, in discovery order.
pub struct Inventory {
    devices: [Device; DEVICE_CAPACITY],
    len: usize,
}

impl Inventory {
    pub const fn new() -> Self {
        Inventory {
            devices: [Device::EMPTY; DEVICE_CAPACITY],
            len: 0,
        }
    }

    pub fn push(&mut self, device: Device) -> Result<()> {
        if self.len == DEVICE_CAPACITY {
            return Err(make_error!(ErrorKind::ResourceExhausted));
        }
        self.devices[self.len] = device;
        self.len += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[Device] {
        &self.devices[..self.len]
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Device> {
        self.as_slice().iter()
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

// Position inside one bus: the next (device, function) to look at.
#[derive(Debug, Clone, Copy)]
struct BusCursor {
    bus: u8,
    device: u8,
    function: u8,
}

impl BusCursor {
    fn new(bus: u8) -> Self {
        BusCursor {
            bus,
            device: 0,
            function: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.device >= DEVICES_PER_BUS
    }

    fn next_device(&mut self) {
        self.device += 1;
        self.function = 0;
    }

    fn next_function(&mut self) {
        self.function += 1;
        if self.function == FUNCTIONS_PER_DEVICE {
            self.next_device();
        }
    }
}

struct VisitedBuses([u64; 4]);

impl VisitedBuses {
    // returns false if the bus was already visited
    fn insert(&mut self, bus: u8) -> bool {
        let (word, bit) = ((bus / 64) as usize, bus % 64);
        let fresh = self.0[word] & (1 << bit) == 0;
        self.0[word] |= 1 << bit;
        fresh
    }
}

struct BusScanner<'a, C: ConfigSpace> {
    cfg: &'a mut C,
    inventory: &'a mut Inventory,
    stack: [BusCursor; MAX_SCAN_DEPTH],
    depth: usize,
    visited: VisitedBuses,
}

impl<'a, C: ConfigSpace> BusScanner<'a, C> {
    fn new(cfg: &'a mut C, inventory: &'a mut Inventory) -> Self {
        BusScanner {
            cfg,
            inventory,
            stack: [BusCursor::new(0); MAX_SCAN_DEPTH],
            depth: 0,
            visited: VisitedBuses([0; 4]),
        }
    }

    fn push_bus(&mut self, bus: u8) -> Result<()> {
        // a misprogrammed bridge may point back at a bus that was already walked
        if !self.visited.insert(bus) {
            return Ok(());
        }
        if self.depth == MAX_SCAN_DEPTH {
            return Err(make_error!(ErrorKind::ResourceExhausted));
        }
        self.stack[self.depth] = BusCursor::new(bus);
        self.depth += 1;
        Ok(())
    }

    fn scan(&mut self, root_bus: u8) -> Result<()> {
        self.push_bus(root_bus)?;

        while self.depth > 0 {
            let top = self.depth - 1;
            let mut cursor = self.stack[top];
            if cursor.is_done() {
                self.depth -= 1;
                continue;
            }

            let (bus, device, function) = (cursor.bus, cursor.device, cursor.function);
            if self.cfg.read_vendor_id(bus, device, function) == VENDOR_ID_ABSENT {
                // no function 0 means no device at all
                if function == 0 {
                    cursor.next_device();
                } else {
                    cursor.next_function();
                }
                self.stack[top] = cursor;
                continue;
            }

            let header_type = self.cfg.read_header_type(bus, device, function);
            let class_code = self.cfg.read_class_code(bus, device, function);
            self.inventory.push(Device {
                bus,
                device,
                function,
                header_type,
                class_code,
            })?;

            // functions 1-7 of a single-function device are never probed
            if function == 0 && is_single_function_device(header_type) {
                cursor.next_device();
            } else {
                cursor.next_function();
            }
            self.stack[top] = cursor;

            if class_code.is_pci_bridge() {
                let bus_numbers = self.cfg.read_bus_numbers(bus, device, function);
                let secondary_bus = ((bus_numbers >> 8) & 0xff) as u8;
                self.push_bus(secondary_bus)?;
            }
        }
        Ok(())
    }
}

// Enumerates every function reachable from the host bridge into `inventory`.
//
// A single-function host bridge owns bus 0. A multi-function host bridge owns one root bus per
// present function (function N decodes bus N).
//
// The scan stops with `ResourceExhausted` as soon as the inventory is full. Everything found up
// to that point stays in `inventory`: callers usually look for one controller, and a partial
// list is still worth searching.
pub fn scan_all_buses<C: ConfigSpace>(cfg: &mut C, inventory: &mut Inventory) -> Result<()> {
    inventory.clear();

    let header_type = cfg.read_header_type(0, 0, 0);
    let mut scanner = BusScanner::new(cfg, inventory);
    if is_single_function_device(header_type) {
        return scanner.scan(0);
    }

    scanner.scan(0)?;
    for function in 1..FUNCTIONS_PER_DEVICE {
        if scanner.cfg.read_vendor_id(0, 0, function) == VENDOR_ID_ABSENT {
            continue;
        }
        scanner.scan(function)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeConfigSpace, FakeFunction};
    use super::super::ClassCode;
    use super::*;
    use std::vec::Vec;

    const HOST_BRIDGE: ClassCode = ClassCode::new(0x06, 0x00, 0x00);
    const XHCI: ClassCode = ClassCode::new(0x0c, 0x03, 0x30);
    const NIC: ClassCode = ClassCode::new(0x02, 0x00, 0x00);

    fn addresses(inventory: &Inventory) -> Vec<(u8, u8, u8)> {
        inventory.iter().map(Device::address).collect()
    }

    #[test]
    fn flat_bus() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 3, 0, FakeFunction::new(0x1b36, 0x000d, XHCI));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(addresses(&inventory), [(0, 0, 0), (0, 3, 0)]);
        assert_eq!(inventory.as_slice()[1].class_code, XHCI);
    }

    #[test]
    fn bridges_are_walked_before_siblings() {
        // bus 0: dev 1 bridge -> bus 1, dev 2 nic
        // bus 1: dev 0 bridge -> bus 2, dev 4 xhci
        // bus 2: dev 7 nic
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 1, 0, FakeFunction::bridge(0x8086, 0, 1));
        cfg.add(0, 2, 0, FakeFunction::new(0x8086, 0x100e, NIC));
        cfg.add(1, 0, 0, FakeFunction::bridge(0x8086, 1, 2));
        cfg.add(1, 4, 0, FakeFunction::new(0x1b36, 0x000d, XHCI));
        cfg.add(2, 7, 0, FakeFunction::new(0x8086, 0x100e, NIC));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(
            addresses(&inventory),
            [(0, 0, 0), (0, 1, 0), (1, 0, 0), (2, 7, 0), (1, 4, 0), (0, 2, 0)]
        );
    }

    #[test]
    fn bridge_on_later_function_is_walked_before_next_function() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 5, 0, FakeFunction::new(0x8086, 0x1234, NIC).multi_function());
        cfg.add(0, 5, 1, FakeFunction::bridge(0x8086, 0, 3));
        cfg.add(0, 5, 2, FakeFunction::new(0x8086, 0x1234, NIC));
        cfg.add(3, 0, 0, FakeFunction::new(0x1b36, 0x000d, XHCI));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(
            addresses(&inventory),
            [(0, 0, 0), (0, 5, 0), (0, 5, 1), (3, 0, 0), (0, 5, 2)]
        );
    }

    #[test]
    fn absent_functions_are_skipped() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 2, 0, FakeFunction::new(0x8086, 0x1234, NIC).multi_function());
        // function 1 and 2 absent
        cfg.add(0, 2, 3, FakeFunction::new(0x8086, 0x1235, XHCI));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(addresses(&inventory), [(0, 0, 0), (0, 2, 0), (0, 2, 3)]);
        assert!(inventory.iter().all(|d| d.address() != (0, 2, 1)));
    }

    #[test]
    fn single_function_device_never_probes_other_functions() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        // would be found if functions 1-7 were probed
        cfg.add(0, 4, 0, FakeFunction::new(0x8086, 0x1234, NIC));
        cfg.add(0, 4, 1, FakeFunction::new(0x8086, 0x1235, XHCI));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(addresses(&inventory), [(0, 0, 0), (0, 4, 0)]);
        for function in 1..8 {
            assert_eq!(cfg.reads_of((0, 4, function)), 0);
        }
    }

    #[test]
    fn multi_function_host_bridge_scans_one_bus_per_function() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE).multi_function());
        cfg.add(0, 0, 2, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 6, 0, FakeFunction::new(0x8086, 0x100e, NIC));
        cfg.add(2, 1, 0, FakeFunction::new(0x1b36, 0x000d, XHCI));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(
            addresses(&inventory),
            [(0, 0, 0), (0, 0, 2), (0, 6, 0), (2, 1, 0)]
        );
    }

    #[test]
    fn bridge_loop_visits_each_bus_once() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, FakeFunction::new(0x8086, 0x29c0, HOST_BRIDGE));
        cfg.add(0, 1, 0, FakeFunction::bridge(0x8086, 0, 1));
        // points back at bus 0
        cfg.add(1, 0, 0, FakeFunction::bridge(0x8086, 1, 0));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(addresses(&inventory), [(0, 0, 0), (0, 1, 0), (1, 0, 0)]);
    }

    fn fixture_with(count: u8) -> FakeConfigSpace {
        let mut cfg = FakeConfigSpace::new();
        for device in 0..count {
            cfg.add(0, device, 0, FakeFunction::new(0x8086, device as u16, NIC));
        }
        cfg
    }

    #[test]
    fn exactly_capacity_devices_fit() {
        let mut cfg = fixture_with(DEVICE_CAPACITY as u8);
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();
        assert_eq!(inventory.len(), DEVICE_CAPACITY);
    }

    #[test]
    fn one_over_capacity_fails_and_keeps_partial_results() {
        let mut cfg = fixture_with(DEVICE_CAPACITY as u8);
        // a second function on device 31 is function number 33
        cfg.add(0, 31, 0, FakeFunction::new(0x8086, 31, NIC).multi_function());
        cfg.add(0, 31, 1, FakeFunction::new(0x8086, 32, NIC));

        let mut inventory = Inventory::new();
        let err = scan_all_buses(&mut cfg, &mut inventory).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(inventory.len(), DEVICE_CAPACITY);
        assert_eq!(inventory.as_slice()[0].address(), (0, 0, 0));
    }

    #[test]
    fn inventory_push_bound() {
        let mut inventory = Inventory::new();
        for _ in 0..DEVICE_CAPACITY {
            inventory.push(Device::EMPTY).unwrap();
        }
        let err = inventory.push(Device::EMPTY).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(inventory.len(), DEVICE_CAPACITY);
    }
}
