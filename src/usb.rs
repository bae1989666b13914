/**
 * The boundary to the USB host controller driver.
 *
 * Bring-up only needs a handful of controller operations: reset and start the controller, look
 * at its root ports, and acknowledge events when the dispatch loop forwards an interrupt.
 * `MmioController` does exactly that at register level. Command, transfer and event rings
 * belong to a full driver and are not modelled here.
 */

use bitflags::bitflags;
use volatile::Volatile;

use crate::dispatch::{MessageHandler, MessageType};
use crate::error::{ErrorKind, Result};
use crate::log::LogLevel;
use crate::{log, make_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    // 1-based, as in the PORTSC register set
    pub number: u8,
    pub connected: bool,
}

pub trait HostController {
    // Resets the controller and enables its interrupter. The controller must be halted.
    fn initialize(&mut self) -> Result<()>;
    fn run(&mut self) -> Result<()>;
    fn max_ports(&self) -> u8;
    fn port_at(&self, number: u8) -> Result<Port>;
    fn configure_port(&mut self, port: &Port) -> Result<()>;
    fn has_pending_event(&self) -> bool;
    fn process_event(&mut self) -> Result<()>;
}

// capability registers
const CAPLENGTH: u64 = 0x00;
const HCSPARAMS1: u64 = 0x04;
const RTSOFF: u64 = 0x18;

// operational registers
const USBCMD: u64 = 0x00;
const USBSTS: u64 = 0x04;
const PORTSC_BASE: u64 = 0x400;
const PORTSC_STRIDE: u64 = 0x10;

// interrupter 0 management register, in the runtime register space
const IMAN0: u64 = 0x20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN_STOP = 1 << 0;
        const HC_RESET = 1 << 1;
        const INTERRUPTER_ENABLE = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const HC_HALTED = 1 << 0;
        // write 1 to clear
        const EVENT_INTERRUPT = 1 << 3;
        const CONTROLLER_NOT_READY = 1 << 11;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CURRENT_CONNECT_STATUS = 1 << 0;
    }
}

bitflags! {
    // interrupter management
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iman: u32 {
        // write 1 to clear
        const INTERRUPT_PENDING = 1 << 0;
        const INTERRUPT_ENABLE = 1 << 1;
    }
}

const POLL_LIMIT: usize = 1_000_000;

// An xHC reached through its memory-mapped registers.
pub struct MmioController {
    cap_base: u64,
    op_base: u64,
    rt_base: u64,
}

impl MmioController {
    // Safety: `mmio_base` must be the controller's BAR0 address, mapped (uncached) at the same
    // virtual address, and nothing else may drive the controller while this value exists.
    pub unsafe fn new(mmio_base: u64) -> Self {
        let cap_length = read_reg(mmio_base + CAPLENGTH) & 0xff;
        let rts_offset = read_reg(mmio_base + RTSOFF) & !0x1f;
        MmioController {
            cap_base: mmio_base,
            op_base: mmio_base + cap_length as u64,
            rt_base: mmio_base + rts_offset as u64,
        }
    }

    fn cap(&self, offset: u64) -> u32 {
        unsafe { read_reg(self.cap_base + offset) }
    }

    fn op(&self, offset: u64) -> &'static mut Volatile<u32> {
        unsafe { register(self.op_base + offset) }
    }

    fn rt(&self, offset: u64) -> &'static mut Volatile<u32> {
        unsafe { register(self.rt_base + offset) }
    }

    fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.op(USBCMD).read())
    }

    fn set_usbcmd(&self, cmd: UsbCmd) {
        self.op(USBCMD).write(cmd.bits());
    }

    fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.op(USBSTS).read())
    }

    fn iman(&self) -> Iman {
        Iman::from_bits_retain(self.rt(IMAN0).read())
    }

    fn set_iman(&self, iman: Iman) {
        self.rt(IMAN0).write(iman.bits());
    }

    fn wait_until(&self, mut done: impl FnMut(&Self) -> bool) -> Result<()> {
        for _ in 0..POLL_LIMIT {
            if done(self) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(make_error!(ErrorKind::Timeout))
    }
}

unsafe fn register(address: u64) -> &'static mut Volatile<u32> {
    &mut *(address as *mut Volatile<u32>)
}

unsafe fn read_reg(address: u64) -> u32 {
    register(address).read()
}

impl HostController for MmioController {
    fn initialize(&mut self) -> Result<()> {
        if !self.usbsts().contains(UsbSts::HC_HALTED) {
            return Err(make_error!(ErrorKind::ControllerNotHalted));
        }

        self.set_usbcmd(self.usbcmd() | UsbCmd::HC_RESET);
        self.wait_until(|hc| !hc.usbcmd().contains(UsbCmd::HC_RESET))?;
        self.wait_until(|hc| !hc.usbsts().contains(UsbSts::CONTROLLER_NOT_READY))?;

        // writing 0 to the pending bit leaves it alone
        self.set_iman(self.iman().difference(Iman::INTERRUPT_PENDING) | Iman::INTERRUPT_ENABLE);
        self.set_usbcmd(self.usbcmd() | UsbCmd::INTERRUPTER_ENABLE);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.set_usbcmd(self.usbcmd() | UsbCmd::RUN_STOP);
        self.wait_until(|hc| !hc.usbsts().contains(UsbSts::HC_HALTED))
    }

    fn max_ports(&self) -> u8 {
        (self.cap(HCSPARAMS1) >> 24) as u8
    }

    fn port_at(&self, number: u8) -> Result<Port> {
        if number == 0 || number > self.max_ports() {
            return Err(make_error!(ErrorKind::IndexOutOfRange));
        }
        let portsc_offset = PORTSC_BASE + PORTSC_STRIDE * (number as u64 - 1);
        let portsc = PortSc::from_bits_retain(self.op(portsc_offset).read());
        Ok(Port {
            number,
            connected: portsc.contains(PortSc::CURRENT_CONNECT_STATUS),
        })
    }

    fn configure_port(&mut self, _port: &Port) -> Result<()> {
        // needs device slots and a control transfer ring
        Err(make_error!(ErrorKind::NotImplemented))
    }

    fn has_pending_event(&self) -> bool {
        self.iman().contains(Iman::INTERRUPT_PENDING)
    }

    fn process_event(&mut self) -> Result<()> {
        // both acknowledge bits are write-1-to-clear
        self.set_iman(self.iman() | Iman::INTERRUPT_PENDING);
        self.op(USBSTS).write(UsbSts::EVENT_INTERRUPT.bits());
        Ok(())
    }
}

// upper bound on events handled per message, so a controller that keeps raising events cannot
// keep the loop from the rest of the queue
const MAX_EVENTS_PER_MESSAGE: usize = 64;

// Routes `InterruptXhci` messages to the controller's event processing.
pub struct XhciMessageHandler<C: HostController> {
    controller: Option<C>,
}

impl<C: HostController> XhciMessageHandler<C> {
    pub fn new(controller: Option<C>) -> Self {
        XhciMessageHandler { controller }
    }

    pub fn controller(&self) -> Option<&C> {
        self.controller.as_ref()
    }
}

impl<C: HostController> MessageHandler for XhciMessageHandler<C> {
    fn handle(&mut self, message: MessageType) -> Result<()> {
        match message {
            MessageType::InterruptXhci => {
                let Some(xhc) = self.controller.as_mut() else {
                    return Err(make_error!(ErrorKind::NotFound));
                };
                let mut handled = 0;
                while handled < MAX_EVENTS_PER_MESSAGE && xhc.has_pending_event() {
                    // one bad event must not strand the rest
                    if let Err(err) = xhc.process_event() {
                        log!(LogLevel::Error, "Error while ProcessEvent: {}", err);
                    }
                    handled += 1;
                }
                Ok(())
            }
        }
    }
}
