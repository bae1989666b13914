/**
 * Boot-time bring-up, from descriptor tables to the dispatch loop.
 *
 * Each step relies on the one before it: the descriptor tables must be loaded before anything
 * can fault safely, the queue must exist before the xHC vector is armed, and the controller
 * must be started before interrupts are enabled. Failures past the descriptor tables are
 * logged and the affected device is left out. Nothing is retried.
 */

use bootloader::BootInfo;
use x86_64::structures::paging::{FrameAllocator, Mapper, Size4KiB};
use x86_64::VirtAddr;

use crate::config::CONFIG;
use crate::dispatch::{self, Dispatcher, InterruptControl};
use crate::error::{ErrorKind, Result};
use crate::interrupts::{self, XHCI_VECTOR};
use crate::log::LogLevel;
use crate::memory::{self, BootInfoFrameAllocator};
use crate::pci::{
    configure_msi_fixed_destination, read_bar, scan_all_buses, switch_ehci_to_xhci,
    ConfigSpace, Device, Inventory, MsiDeliveryMode, MsiTriggerMode, PortConfigSpace,
    VENDOR_INTEL,
};
use crate::usb::{HostController, MmioController, XhciMessageHandler};
use crate::{allocator, apic, gdt, hlt_loop, log, make_error};

// Picks the xHC to drive: an Intel one if present, otherwise the first one found.
pub fn find_xhc(inventory: &Inventory, cfg: &mut impl ConfigSpace) -> Option<Device> {
    let mut first = None;
    for dev in inventory.iter().filter(|dev| dev.class_code.is_xhci()) {
        if dev.vendor_id(cfg) == VENDOR_INTEL {
            return Some(*dev);
        }
        first.get_or_insert(*dev);
    }
    first
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhcSetup {
    pub device: Device,
    // physical address of the register window, flag bits masked off
    pub mmio_base: u64,
}

// Routes the xHC's interrupts to `apic_id` and finds its registers.
// A failed MSI setup is logged and bring-up carries on without interrupts from the controller.
pub fn configure_xhc(
    cfg: &mut impl ConfigSpace,
    inventory: &Inventory,
    apic_id: u8,
) -> Result<XhcSetup> {
    prepare_xhc(cfg, inventory, apic_id, || {})
}

// Same as `configure_xhc`, calling `arm` once the controller has been located and before its
// MSI routing is written. Without a controller nothing is armed.
fn prepare_xhc(
    cfg: &mut impl ConfigSpace,
    inventory: &Inventory,
    apic_id: u8,
    arm: impl FnOnce(),
) -> Result<XhcSetup> {
    let device = find_xhc(inventory, cfg).ok_or(make_error!(ErrorKind::NotFound))?;
    log!(
        LogLevel::Info,
        "xHC has been found: {}.{}.{}",
        device.bus,
        device.device,
        device.function
    );

    arm();
    if let Err(err) = configure_msi_fixed_destination(
        cfg,
        &device,
        apic_id,
        MsiTriggerMode::Level,
        MsiDeliveryMode::Fixed,
        XHCI_VECTOR,
        CONFIG.xhc_msi_vector_exponent,
    ) {
        log!(LogLevel::Error, "failed to configure MSI for xHC: {}", err);
    }

    if device.vendor_id(cfg) == VENDOR_INTEL {
        switch_ehci_to_xhci(cfg, inventory, &device);
    }

    let bar = read_bar(cfg, &device, 0)?;
    let mmio_base = bar & !0xf;
    log!(LogLevel::Debug, "xHC mmio_base = {:08x}", mmio_base);
    Ok(XhcSetup { device, mmio_base })
}

fn log_inventory(cfg: &mut impl ConfigSpace, inventory: &Inventory) {
    for dev in inventory.iter() {
        log!(
            LogLevel::Debug,
            "{}.{}.{}: vend {:04x}, class {:02x}{:02x}{:02x}, head {:02x}",
            dev.bus,
            dev.device,
            dev.function,
            dev.vendor_id(cfg),
            dev.class_code.base,
            dev.class_code.sub,
            dev.class_code.interface,
            dev.header_type
        );
    }
}

fn enumerate(cfg: &mut impl ConfigSpace) -> Inventory {
    let mut inventory = Inventory::new();
    // whatever was found before a failure is still usable
    if let Err(err) = scan_all_buses(cfg, &mut inventory) {
        log!(LogLevel::Error, "ScanAllBus: {}", err);
    }
    log!(LogLevel::Info, "ScanAllBus: {} device(s)", inventory.len());
    log_inventory(cfg, &inventory);
    inventory
}

fn start_xhc(
    setup: &XhcSetup,
    mapper: &mut impl Mapper<Size4KiB>,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Option<MmioController> {
    if let Err(err) = unsafe {
        memory::identity_map(mapper, frame_allocator, setup.mmio_base, CONFIG.xhc_mmio_window)
    } {
        log!(LogLevel::Error, "failed to map xHC registers: {:?}", err);
        return None;
    }

    let mut xhc = unsafe { MmioController::new(setup.mmio_base) };
    if let Err(err) = xhc.initialize() {
        log!(LogLevel::Error, "xhc initialize: {}", err);
        return None;
    }
    log!(LogLevel::Info, "xHC starting");
    if let Err(err) = xhc.run() {
        log!(LogLevel::Error, "xhc run: {}", err);
    }
    Some(xhc)
}

fn configure_connected_ports(xhc: &mut impl HostController) {
    for number in 1..=xhc.max_ports() {
        let port = match xhc.port_at(number) {
            Ok(port) => port,
            Err(err) => {
                log!(LogLevel::Error, "port {}: {}", number, err);
                continue;
            }
        };
        if !port.connected {
            continue;
        }
        if let Err(err) = xhc.configure_port(&port) {
            log!(LogLevel::Error, "failed to configure port {}: {}", number, err);
        }
    }
}

// Brings the machine up and hands over to the dispatch loop. Never returns.
pub fn run(boot_info: &'static BootInfo) -> ! {
    log::set_log_level(CONFIG.log_level);

    gdt::init();
    interrupts::init_idt();
    apic::disable_legacy_pic();
    log!(LogLevel::Info, "descriptor tables loaded");

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
    let mut mapper = unsafe { memory::init(phys_mem_offset) };
    let mut frame_allocator = unsafe { BootInfoFrameAllocator::init(&boot_info.memory_map) };
    if let Err(err) = allocator::init_heap(&mut mapper, &mut frame_allocator) {
        log!(LogLevel::Error, "heap initialization failed: {:?}", err);
        hlt_loop();
    }

    // the EOI register must be reachable before any vector is armed
    if let Err(err) = unsafe {
        memory::identity_map(
            &mut mapper,
            &mut frame_allocator,
            apic::LOCAL_APIC_BASE,
            apic::LOCAL_APIC_SIZE,
        )
    } {
        log!(LogLevel::Error, "failed to map local APIC: {:?}", err);
        hlt_loop();
    }
    apic::enable_local_apic();
    let apic_id = apic::local_apic_id();

    let queue = match dispatch::init_main_queue(CONFIG.main_queue_capacity) {
        Ok(queue) => queue,
        Err(err) => {
            log!(LogLevel::Error, "main queue: {}", err);
            hlt_loop();
        }
    };

    let mut cfg = unsafe { PortConfigSpace::new() };
    let inventory = enumerate(&mut cfg);

    // the vector is armed only once a controller is known to exist
    let mut xhc = match prepare_xhc(&mut cfg, &inventory, apic_id, || {
        interrupts::arm_xhci(queue)
    }) {
        Ok(setup) => start_xhc(&setup, &mut mapper, &mut frame_allocator),
        Err(err) => {
            log!(LogLevel::Warn, "no usable xHC: {}", err);
            None
        }
    };

    let mut cpu = dispatch::Cpu;
    cpu.enable();
    log!(LogLevel::Info, "interrupts enabled");

    if let Some(xhc) = xhc.as_mut() {
        configure_connected_ports(xhc);
    }

    let mut handler = XhciMessageHandler::new(xhc);
    Dispatcher::new(&queue, cpu).run(&mut handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::{arm_xhci_in, InterruptDescriptorTable};
    use crate::pci::testing::{FakeConfigSpace, FakeFunction};
    use crate::pci::{ClassCode, REG_BAR0, REG_CAPABILITY_POINTER};

    const XHCI_CLASS: ClassCode = ClassCode::new(0x0c, 0x03, 0x30);
    const VENDOR_QEMU: u16 = 0x1b36;

    // MSI capability at 0x50 with 64-bit addressing
    fn xhci_function(vendor_id: u16) -> FakeFunction {
        FakeFunction::new(vendor_id, 0x000d, XHCI_CLASS)
            .reg(REG_BAR0, 0xfebf_0004)
            .reg(REG_BAR0 + 4, 0)
            .reg(REG_CAPABILITY_POINTER, 0x50)
            .reg(0x50, 0x0080_0005)
    }

    fn host_bridge() -> FakeFunction {
        FakeFunction::new(VENDOR_INTEL, 0x29c0, ClassCode::new(0x06, 0x00, 0x00))
    }

    #[test]
    fn root_bus_with_xhc_end_to_end() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 3, 0, xhci_function(VENDOR_QEMU));

        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();
        assert_eq!(inventory.len(), 2);

        let setup = configure_xhc(&mut cfg, &inventory, 0).unwrap();
        assert_eq!(setup.device.address(), (0, 3, 0));
        assert_eq!(setup.mmio_base, 0xfebf_0000);

        // MSI: control, address, upper address, data, then control with enable
        let writes = cfg.writes_to((0, 3, 0));
        assert_eq!(
            writes,
            [
                (0x50, 0x0080_0005),
                (0x54, 0xfee0_0000),
                (0x58, 0),
                (0x5c, 0xc000 | XHCI_VECTOR as u32),
                (0x50, 0x0081_0005),
            ]
        );
        // nothing else in the fixture was written
        assert_eq!(cfg.writes.len(), writes.len());
    }

    #[test]
    fn vector_is_armed_only_when_a_controller_exists() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge());
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        let mut idt = InterruptDescriptorTable::new();
        let queue = dispatch::test_main_queue();
        let err =
            prepare_xhc(&mut cfg, &inventory, 0, || arm_xhci_in(&mut idt, queue)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!idt.entry(XHCI_VECTOR).attributes().is_present());

        cfg.add(0, 3, 0, xhci_function(VENDOR_QEMU));
        scan_all_buses(&mut cfg, &mut inventory).unwrap();
        prepare_xhc(&mut cfg, &inventory, 0, || arm_xhci_in(&mut idt, queue)).unwrap();
        assert!(idt.entry(XHCI_VECTOR).attributes().is_present());
    }

    #[test]
    fn prefers_intel_xhc() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 2, 0, xhci_function(VENDOR_QEMU))
            .add(0, 0x14, 0, xhci_function(VENDOR_INTEL));
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        let xhc = find_xhc(&inventory, &mut cfg).unwrap();
        assert_eq!(xhc.address(), (0, 0x14, 0));
    }

    #[test]
    fn falls_back_to_first_xhc() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 2, 0, xhci_function(VENDOR_QEMU))
            .add(0, 5, 0, xhci_function(VENDOR_QEMU));
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        assert_eq!(find_xhc(&inventory, &mut cfg).unwrap().address(), (0, 2, 0));
    }

    #[test]
    fn missing_xhc_is_not_found() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 1, 0, FakeFunction::new(0x10de, 0x0001, ClassCode::new(0x03, 0x00, 0x00)));
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        let err = configure_xhc(&mut cfg, &inventory, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(cfg.writes.is_empty());
    }

    #[test]
    fn msi_failure_does_not_stop_configuration() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 3, 0, FakeFunction::new(VENDOR_QEMU, 0x000d, XHCI_CLASS).reg(REG_BAR0, 0xfebf_1000));
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        let setup = configure_xhc(&mut cfg, &inventory, 2).unwrap();
        assert_eq!(setup.mmio_base, 0xfebf_1000);
        assert!(cfg.writes.is_empty());
    }

    #[test]
    fn intel_xhc_takes_ports_from_intel_ehci() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0, 0, host_bridge())
            .add(0, 0x14, 0, xhci_function(VENDOR_INTEL).reg(0xd4, 0x0f).reg(0xdc, 0x0f))
            .add(0, 0x1d, 0, FakeFunction::new(VENDOR_INTEL, 0x1e26, ClassCode::new(0x0c, 0x03, 0x20)));
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();

        configure_xhc(&mut cfg, &inventory, 0).unwrap();
        let writes = cfg.writes_to((0, 0x14, 0));
        assert!(writes.contains(&(0xd8, 0x0f)));
        assert!(writes.contains(&(0xd0, 0x0f)));
    }

    #[test]
    fn only_connected_ports_are_configured() {
        struct Ports {
            connected: [bool; 4],
            configured: std::vec::Vec<u8>,
        }

        impl HostController for Ports {
            fn initialize(&mut self) -> Result<()> {
                Ok(())
            }
            fn run(&mut self) -> Result<()> {
                Ok(())
            }
            fn max_ports(&self) -> u8 {
                self.connected.len() as u8
            }
            fn port_at(&self, number: u8) -> Result<crate::usb::Port> {
                Ok(crate::usb::Port {
                    number,
                    connected: self.connected[number as usize - 1],
                })
            }
            fn configure_port(&mut self, port: &crate::usb::Port) -> Result<()> {
                self.configured.push(port.number);
                Err(make_error!(ErrorKind::NotImplemented))
            }
            fn has_pending_event(&self) -> bool {
                false
            }
            fn process_event(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut xhc = Ports {
            connected: [false, true, false, true],
            configured: std::vec::Vec::new(),
        };
        configure_connected_ports(&mut xhc);
        assert_eq!(xhc.configured, [2, 4]);
    }
}
