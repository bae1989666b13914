/**
 * This module builds the Global Descriptor Table (GDT) by hand: a null entry, a flat 64-bit
 * kernel code segment, a flat kernel data segment and a Task State Segment (TSS). The TSS holds
 * the Interrupt Stack Table entry the double fault handler switches to, so a kernel stack
 * overflow ends in a reported double fault instead of a triple fault.
 */
use core::mem::size_of;
use core::ptr::addr_of;

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::{lgdt, load_tss};
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::structures::DescriptorTablePointer;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::descriptor::{code_segment, data_segment, tss_segment, SegmentDescriptor, SegmentType};

// Interrupt Stack Table slot used by the double fault gate. The gate's stack field counts from
// 1 (0 means "no switch"), the TSS array counts from 0.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
pub const KERNEL_SS: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring0);

const GDT_ENTRIES: usize = 5;

// 20-bit page-granular limit covering the whole (identity-mapped) address space
const FLAT_LIMIT: u32 = 0xfffff;

pub struct GlobalDescriptorTable {
    entries: [SegmentDescriptor; GDT_ENTRIES],
}

impl GlobalDescriptorTable {
    pub fn new(tss: &'static TaskStateSegment) -> Self {
        let tss_base = tss as *const TaskStateSegment as u64;
        let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
        let (tss_low, tss_high) = tss_segment(tss_base, tss_limit);

        GlobalDescriptorTable {
            entries: [
                // entry 0 is never used by the hardware
                SegmentDescriptor::NULL,
                code_segment(SegmentType::ExecuteRead, 0, 0, FLAT_LIMIT),
                data_segment(SegmentType::ReadWrite, 0, 0, FLAT_LIMIT),
                tss_low,
                tss_high,
            ],
        }
    }

    pub fn entries(&self) -> &[SegmentDescriptor] {
        &self.entries
    }

    // Loads the table into GDTR. The table must live for the rest of the kernel's lifetime,
    // hence `&'static self`.
    pub fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
            base: VirtAddr::new(self.entries.as_ptr() as u64),
        };
        unsafe { lgdt(&pointer) };
    }
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[(DOUBLE_FAULT_IST_INDEX - 1) as usize] = {
            // 4096 bytes * 5 = 20 kilobytes
            const STACK_SIZE: usize = 4096 * 5;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

            let stack_start = VirtAddr::from_ptr(addr_of!(STACK));
            // the stack grows downwards, so the IST entry holds the top address
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: GlobalDescriptorTable = GlobalDescriptorTable::new(&TSS);
}

// Installs the GDT and reloads every segment register from it. A malformed table is not
// recoverable: the next selector load faults.
pub fn init() {
    GDT.load();
    unsafe {
        // data segment registers are ignored in long mode; keep them null
        let null = SegmentSelector(0);
        DS::set_reg(null);
        ES::set_reg(null);
        FS::set_reg(null);
        GS::set_reg(null);
        CS::set_reg(KERNEL_CS);
        SS::set_reg(KERNEL_SS);
        load_tss(TSS_SELECTOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_index_the_table() {
        assert_eq!(KERNEL_CS.0, 0x08);
        assert_eq!(KERNEL_SS.0, 0x10);
        assert_eq!(TSS_SELECTOR.0, 0x18);
    }

    #[test]
    fn table_layout() {
        let entries = GDT.entries();
        assert_eq!(entries[0], SegmentDescriptor::NULL);
        assert!(entries[1].is_long_mode());
        assert!(entries[2].is_default_operation_size());
        assert_eq!(entries[3].base(), (&*TSS as *const TaskStateSegment as u64) as u32);
        assert_eq!(entries[4].bits(), (&*TSS as *const TaskStateSegment as u64) >> 32);
    }
}
