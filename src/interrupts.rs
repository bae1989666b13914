use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::tables::lidt;
use x86_64::structures::idt::InterruptStackFrame;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::descriptor::{interrupt_gate, DescriptorType, InterruptDescriptor};
use crate::dispatch::{self, MainQueue, Message, MessageType};
use crate::log::LogLevel;
use crate::{apic, config::CONFIG, gdt, log};

pub const BREAKPOINT_VECTOR: u8 = 3;
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
pub const XHCI_VECTOR: u8 = CONFIG.xhc_vector;
pub const SPURIOUS_VECTOR: u8 = 0xff;

const IDT_ENTRIES: usize = 256;

type Handler = extern "x86-interrupt" fn(InterruptStackFrame);
type DivergingHandlerWithErrCode = extern "x86-interrupt" fn(InterruptStackFrame, u64) -> !;

// One gate per vector. Every vector starts out non-present; a vector only becomes present when
// the feature that owns it is set up.
pub struct InterruptDescriptorTable {
    entries: [InterruptDescriptor; IDT_ENTRIES],
}

impl InterruptDescriptorTable {
    pub const fn new() -> Self {
        InterruptDescriptorTable {
            entries: [InterruptDescriptor::MISSING; IDT_ENTRIES],
        }
    }

    // `vector` is a u8, so every index is inside the table
    pub fn set_entry(&mut self, vector: u8, descriptor: InterruptDescriptor) {
        self.entries[vector as usize] = descriptor;
    }

    pub fn entry(&self, vector: u8) -> &InterruptDescriptor {
        &self.entries[vector as usize]
    }

    fn pointer(&self) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (size_of::<[InterruptDescriptor; IDT_ENTRIES]>() - 1) as u16,
            base: VirtAddr::new(self.entries.as_ptr() as u64),
        }
    }
}

impl Default for InterruptDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

fn kernel_gate(handler_address: u64, stack_index: u8) -> InterruptDescriptor {
    interrupt_gate(
        handler_address,
        gdt::KERNEL_CS.0,
        DescriptorType::InterruptGate,
        0,
        true,
        stack_index,
    )
}

lazy_static! {
    // the CPU keeps reading this table after `lidt`, so it lives in a static for good
    static ref IDT: Mutex<InterruptDescriptorTable> = {
        let mut idt = InterruptDescriptorTable::new();
        idt.set_entry(
            BREAKPOINT_VECTOR,
            kernel_gate(breakpoint_handler as Handler as usize as u64, 0),
        );
        // a double fault caused by a kernel stack overflow could not push its frame onto the
        // same stack, so it switches to the dedicated IST stack
        idt.set_entry(
            DOUBLE_FAULT_VECTOR,
            kernel_gate(
                double_fault_handler as DivergingHandlerWithErrCode as usize as u64,
                gdt::DOUBLE_FAULT_IST_INDEX,
            ),
        );
        idt.set_entry(
            SPURIOUS_VECTOR,
            kernel_gate(spurious_interrupt_handler as Handler as usize as u64, 0),
        );
        Mutex::new(idt)
    };
}

// Loads the interrupt descriptor table. Only the exception vectors are present at this point.
pub fn init_idt() {
    let idt = IDT.lock();
    unsafe { lidt(&idt.pointer()) };
}

// Arms the xHC vector in `idt`. Taking the main queue handle means the handler's queue exists
// before the gate turns present; interrupts are still globally masked here.
pub fn arm_xhci_in(idt: &mut InterruptDescriptorTable, _queue: MainQueue) {
    idt.set_entry(
        XHCI_VECTOR,
        kernel_gate(xhci_interrupt_handler as Handler as usize as u64, 0),
    );
}

// Arms the xHC vector in the loaded table.
pub fn arm_xhci(queue: MainQueue) {
    arm_xhci_in(&mut IDT.lock(), queue);
    log!(LogLevel::Debug, "vector {:#x} armed for xHC", XHCI_VECTOR);
}

pub fn is_armed(vector: u8) -> bool {
    IDT.lock().entry(vector).attributes().is_present()
}

// the x86-interrupt calling convention preserves every register, since an interrupt can arrive
// between any two instructions
extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log!(LogLevel::Warn, "EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

// spurious interrupts are not acknowledged
extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {}

// Interrupt context: enqueue and acknowledge, nothing else. No logging, no allocation.
extern "x86-interrupt" fn xhci_interrupt_handler(_stack_frame: InterruptStackFrame) {
    dispatch::signal(Message::new(MessageType::InterruptXhci));
    apic::notify_end_of_interrupt();
}
