/**
 * Moving USB ports from an Intel EHCI to the xHC.
 *
 * On Intel chipsets the USB 2 ports start out routed to the EHCI. Until they are switched over
 * (and SuperSpeed is enabled on them), the xHC sees nothing on those ports. The switch must
 * happen before the xHC is started.
 */

use super::{ConfigSpace, Device, Inventory, VENDOR_INTEL};
use crate::log;
use crate::log::LogLevel;

// xHC configuration registers (Intel chipset specific)
const REG_XUSB2PR: u8 = 0xd0;
const REG_XUSB2PRM: u8 = 0xd4;
const REG_USB3_PSSEN: u8 = 0xd8;
const REG_USB3PRM: u8 = 0xdc;

// Returns true if an Intel EHCI was found and the ports were handed to `xhc`.
pub fn switch_ehci_to_xhci(
    cfg: &mut impl ConfigSpace,
    inventory: &Inventory,
    xhc: &Device,
) -> bool {
    let intel_ehc_exists = inventory
        .iter()
        .any(|dev| dev.class_code.is_ehci() && dev.vendor_id(cfg) == VENDOR_INTEL);
    if !intel_ehc_exists {
        return false;
    }

    // enable SuperSpeed on every port the mask allows, then route them to the xHC
    let superspeed_ports = cfg.read_conf_reg(xhc, REG_USB3PRM);
    cfg.write_conf_reg(xhc, REG_USB3_PSSEN, superspeed_ports);
    let ehci2xhci_ports = cfg.read_conf_reg(xhc, REG_XUSB2PRM);
    cfg.write_conf_reg(xhc, REG_XUSB2PR, ehci2xhci_ports);
    log!(
        LogLevel::Debug,
        "switch_ehci_to_xhci: SS = {:02x}, xHCI = {:02x}",
        superspeed_ports,
        ehci2xhci_ports
    );
    true
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeConfigSpace, FakeFunction};
    use super::super::{scan_all_buses, ClassCode};
    use super::*;

    const EHCI: ClassCode = ClassCode::new(0x0c, 0x03, 0x20);
    const XHCI: ClassCode = ClassCode::new(0x0c, 0x03, 0x30);

    fn xhc_function() -> FakeFunction {
        FakeFunction::new(VENDOR_INTEL, 0x1e31, XHCI)
            .reg(REG_USB3PRM, 0x0f)
            .reg(REG_XUSB2PRM, 0x3f)
    }

    #[test]
    fn routes_ports_when_intel_ehci_present() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0x1a, 0, FakeFunction::new(VENDOR_INTEL, 0x1e2d, EHCI));
        cfg.add(0, 0x14, 0, xhc_function());
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();
        let xhc = *inventory.iter().find(|d| d.class_code.is_xhci()).unwrap();

        assert!(switch_ehci_to_xhci(&mut cfg, &inventory, &xhc));
        assert_eq!(
            cfg.writes_to((0, 0x14, 0)),
            [(REG_USB3_PSSEN, 0x0f), (REG_XUSB2PR, 0x3f)]
        );
    }

    #[test]
    fn leaves_ports_alone_without_intel_ehci() {
        let mut cfg = FakeConfigSpace::new();
        cfg.add(0, 0x1a, 0, FakeFunction::new(0x1106, 0x3104, EHCI));
        cfg.add(0, 0x14, 0, xhc_function());
        let mut inventory = Inventory::new();
        scan_all_buses(&mut cfg, &mut inventory).unwrap();
        let xhc = *inventory.iter().find(|d| d.class_code.is_xhci()).unwrap();

        assert!(!switch_ehci_to_xhci(&mut cfg, &inventory, &xhc));
        assert!(cfg.writes.is_empty());
    }
}
