/**
 * Capability list walking and Message Signaled Interrupt setup.
 */

use bitflags::bitflags;

use super::{ConfigSpace, Device, REG_CAPABILITY_POINTER};
use crate::error::{ErrorKind, Result};
use crate::make_error;

pub const CAPABILITY_MSI: u8 = 0x05;
pub const CAPABILITY_MSIX: u8 = 0x11;

// capabilities live after the 64-byte standard header
const FIRST_CAPABILITY_OFFSET: u8 = 0x40;

bitflags! {
    // Message control, in the upper half of the capability header dword. The low half (ID and
    // next pointer) is carried along untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsiControl: u32 {
        const ENABLE = 1 << 16;
        const MULTI_MSG_CAPABLE = 0b111 << 17;
        const MULTI_MSG_ENABLE = 0b111 << 20;
        const ADDR_64_CAPABLE = 1 << 23;
        const PER_VECTOR_MASK_CAPABLE = 1 << 24;
    }
}

const MULTI_MSG_CAPABLE_SHIFT: u32 = 17;
const MULTI_MSG_ENABLE_SHIFT: u32 = 20;

const MSI_ADDRESS_BASE: u32 = 0xfee0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiTriggerMode {
    Edge = 0,
    Level = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiDeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    ExtInt = 0b111,
}

// One entry of a function's capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub offset: u8,
    pub id: u8,
    pub header: u32,
}

// Iterator over a function's capability list.
//
// Stops at a next pointer of 0, at a pointer into the standard header, or at an offset it has
// already visited, so a corrupted list cannot spin forever.
pub struct Capabilities<'a, C: ConfigSpace> {
    cfg: &'a mut C,
    device: Device,
    next: u8,
    // one bit per dword of the 256-byte configuration space
    visited: u64,
}

impl<C: ConfigSpace> Iterator for Capabilities<'_, C> {
    type Item = Capability;

    fn next(&mut self) -> Option<Capability> {
        let offset = self.next;
        if offset < FIRST_CAPABILITY_OFFSET {
            return None;
        }
        let bit = 1u64 << (offset >> 2);
        if self.visited & bit != 0 {
            return None;
        }
        self.visited |= bit;

        let header = self.cfg.read_conf_reg(&self.device, offset);
        self.next = ((header >> 8) & 0xfc) as u8;
        Some(Capability {
            offset,
            id: (header & 0xff) as u8,
            header,
        })
    }
}

pub fn capabilities<'a, C: ConfigSpace>(cfg: &'a mut C, device: &Device) -> Capabilities<'a, C> {
    let next = (cfg.read_conf_reg(device, REG_CAPABILITY_POINTER) & 0xfc) as u8;
    Capabilities {
        cfg,
        device: *device,
        next,
        visited: 0,
    }
}

// Decoded MSI capability header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    offset: u8,
    control: MsiControl,
}

impl MsiCapability {
    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn is_enabled(&self) -> bool {
        self.control.contains(MsiControl::ENABLE)
    }

    // log2 of the number of vectors the function can request.
    pub fn multi_msg_capable(&self) -> u8 {
        ((self.control & MsiControl::MULTI_MSG_CAPABLE).bits() >> MULTI_MSG_CAPABLE_SHIFT) as u8
    }

    pub fn multi_msg_enable(&self) -> u8 {
        ((self.control & MsiControl::MULTI_MSG_ENABLE).bits() >> MULTI_MSG_ENABLE_SHIFT) as u8
    }

    pub fn is_addr_64_capable(&self) -> bool {
        self.control.contains(MsiControl::ADDR_64_CAPABLE)
    }

    pub fn is_per_vector_mask_capable(&self) -> bool {
        self.control.contains(MsiControl::PER_VECTOR_MASK_CAPABLE)
    }

    fn data_offset(&self) -> u8 {
        if self.is_addr_64_capable() {
            self.offset + 12
        } else {
            self.offset + 8
        }
    }
}

// Finds the MSI capability. MSI-X entries are passed over.
pub fn find_msi_capability(cfg: &mut impl ConfigSpace, device: &Device) -> Result<MsiCapability> {
    capabilities(cfg, device)
        .find(|cap| cap.id == CAPABILITY_MSI)
        .map(|cap| MsiCapability {
            offset: cap.offset,
            control: MsiControl::from_bits_retain(cap.header),
        })
        .ok_or(make_error!(ErrorKind::NotFound))
}

// Programs the MSI capability of `device` with the given address/data pair and enables it.
//
// The function may use 2^`num_vector_exponent` vectors; asking for more than the capability
// advertises fails with `Unsupported` before anything is written. The enable bit is written
// last: the device may start signalling as soon as it is set.
pub fn configure_msi(
    cfg: &mut impl ConfigSpace,
    device: &Device,
    msg_addr: u32,
    msg_data: u32,
    num_vector_exponent: u8,
) -> Result<()> {
    let msi = find_msi_capability(cfg, device)?;
    if num_vector_exponent > msi.multi_msg_capable() {
        return Err(make_error!(ErrorKind::Unsupported));
    }

    let control = msi.control.difference(MsiControl::ENABLE | MsiControl::MULTI_MSG_ENABLE)
        | MsiControl::from_bits_retain((num_vector_exponent as u32) << MULTI_MSG_ENABLE_SHIFT);
    cfg.write_conf_reg(device, msi.offset, control.bits());
    cfg.write_conf_reg(device, msi.offset + 4, msg_addr);
    if msi.is_addr_64_capable() {
        cfg.write_conf_reg(device, msi.offset + 8, 0);
    }
    cfg.write_conf_reg(device, msi.data_offset(), msg_data);
    cfg.write_conf_reg(device, msi.offset, (control | MsiControl::ENABLE).bits());
    Ok(())
}

// Routes `device`'s MSI to `vector` on the local APIC `apic_id`.
pub fn configure_msi_fixed_destination(
    cfg: &mut impl ConfigSpace,
    device: &Device,
    apic_id: u8,
    trigger_mode: MsiTriggerMode,
    delivery_mode: MsiDeliveryMode,
    vector: u8,
    num_vector_exponent: u8,
) -> Result<()> {
    let msg_addr = MSI_ADDRESS_BASE | ((apic_id as u32) << 12);
    let mut msg_data = ((delivery_mode as u32) << 8) | vector as u32;
    if trigger_mode == MsiTriggerMode::Level {
        // trigger mode (bit 15) and level assert (bit 14)
        msg_data |= 0xc000;
    }
    configure_msi(cfg, device, msg_addr, msg_data, num_vector_exponent)
}
