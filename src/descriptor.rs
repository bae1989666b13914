/**
 * Bit-exact x86_64 segment and gate descriptors.
 *
 * Segment descriptor (8 bytes):
 *
 *  63      56 55 54 53 52 51   48 47 46 45 44 43   40 39        32
 * | base 31:24| G| D| L|AV|lim 19:16| P| DPL | S| type  | base 23:16 |
 *  31                              16 15                            0
 * |          base 15:0              |          limit 15:0          |
 *
 * Interrupt gate descriptor (16 bytes): offset 15:0, selector, attribute word, offset 31:16,
 * offset 63:32, reserved.
 */
use bitflags::bitflags;

// The 4-bit type field of system segments and gates.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    TssAvailable = 9,
    InterruptGate = 14,
    TrapGate = 15,
}

// Code and data segment types (non-system descriptors).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    ReadWrite = 2,
    ExecuteRead = 10,
}

bitflags! {
    // Flag bits of a segment descriptor, at their position in the 64-bit entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u64 {
        // code or data segment (clear for system segments)
        const NON_SYSTEM = 1 << 44;
        const PRESENT = 1 << 47;
        const LONG_MODE = 1 << 53;
        const DEFAULT_OPERATION_SIZE = 1 << 54;
        // limit counts 4 KiB pages
        const GRANULARITY = 1 << 55;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GateFlags: u16 {
        const PRESENT = 1 << 15;
    }
}

const TYPE_SHIFT: u64 = 40;
const DPL_SHIFT: u64 = 45;

// An 8-byte GDT entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const NULL: SegmentDescriptor = SegmentDescriptor(0);

    pub const fn from_bits(bits: u64) -> Self {
        SegmentDescriptor(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn base(self) -> u32 {
        (((self.0 >> 16) & 0xff_ffff) | (((self.0 >> 56) & 0xff) << 24)) as u32
    }

    pub const fn limit(self) -> u32 {
        ((self.0 & 0xffff) | (((self.0 >> 48) & 0xf) << 16)) as u32
    }

    pub const fn privilege_level(self) -> u8 {
        ((self.0 >> DPL_SHIFT) & 0b11) as u8
    }

    pub const fn flags(self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.0)
    }

    pub const fn is_present(self) -> bool {
        self.flags().contains(SegmentFlags::PRESENT)
    }

    pub const fn is_long_mode(self) -> bool {
        self.flags().contains(SegmentFlags::LONG_MODE)
    }

    pub const fn is_default_operation_size(self) -> bool {
        self.flags().contains(SegmentFlags::DEFAULT_OPERATION_SIZE)
    }
}

const fn base_and_limit(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xffff)
        | ((base & 0xffff) << 16)
        | (((base >> 16) & 0xff) << 32)
        | (((limit >> 16) & 0xf) << 48)
        | (((base >> 24) & 0xff) << 56)
}

// A present, 64-bit, page-granular code segment. `limit` is the 20-bit page count; 0xfffff
// covers the whole address space.
pub const fn code_segment(
    segment_type: SegmentType,
    privilege_level: u8,
    base: u32,
    limit: u32,
) -> SegmentDescriptor {
    let flags = SegmentFlags::NON_SYSTEM
        .union(SegmentFlags::PRESENT)
        .union(SegmentFlags::LONG_MODE)
        .union(SegmentFlags::GRANULARITY);
    let bits = base_and_limit(base, limit)
        | ((segment_type as u64) << TYPE_SHIFT)
        | (((privilege_level & 0b11) as u64) << DPL_SHIFT)
        | flags.bits();
    SegmentDescriptor(bits)
}

// Same layout as a code segment, with long mode cleared and default operation size set.
pub const fn data_segment(
    segment_type: SegmentType,
    privilege_level: u8,
    base: u32,
    limit: u32,
) -> SegmentDescriptor {
    let code = code_segment(segment_type, privilege_level, base, limit);
    SegmentDescriptor(
        (code.0 & !SegmentFlags::LONG_MODE.bits()) | SegmentFlags::DEFAULT_OPERATION_SIZE.bits(),
    )
}

// 64-bit TSS descriptor. System descriptors are 16 bytes wide and occupy two GDT slots; the
// returned pair is (low, high).
pub const fn tss_segment(base: u64, limit: u32) -> (SegmentDescriptor, SegmentDescriptor) {
    let low = base_and_limit(base as u32, limit)
        | ((DescriptorType::TssAvailable as u64) << TYPE_SHIFT)
        | SegmentFlags::PRESENT.bits();
    let high = base >> 32;
    (SegmentDescriptor(low), SegmentDescriptor(high))
}

// The attribute word of a gate descriptor.
// bits 0-2: interrupt stack table index (0 = no stack switch), 8-11: type, 13-14: DPL,
// 15: present
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptDescriptorAttribute(u16);

impl InterruptDescriptorAttribute {
    pub const fn new(
        gate_type: DescriptorType,
        privilege_level: u8,
        present: bool,
        stack_index: u8,
    ) -> Self {
        let mut bits = (stack_index as u16 & 0b111)
            | ((gate_type as u16 & 0xf) << 8)
            | ((privilege_level as u16 & 0b11) << 13);
        if present {
            bits |= GateFlags::PRESENT.bits();
        }
        InterruptDescriptorAttribute(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn stack_index(self) -> u8 {
        (self.0 & 0b111) as u8
    }

    pub const fn gate_type(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    pub const fn privilege_level(self) -> u8 {
        ((self.0 >> 13) & 0b11) as u8
    }

    pub const fn is_present(self) -> bool {
        GateFlags::from_bits_truncate(self.0).contains(GateFlags::PRESENT)
    }
}

// A 16-byte IDT entry. The handler address is split across three fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptDescriptor {
    offset_low: u16,
    segment_selector: u16,
    attr: InterruptDescriptorAttribute,
    offset_middle: u16,
    offset_high: u32,
    reserved: u32,
}

impl InterruptDescriptor {
    // a non-present entry: an interrupt on this vector is recognisably unconfigured
    pub const MISSING: InterruptDescriptor = InterruptDescriptor {
        offset_low: 0,
        segment_selector: 0,
        attr: InterruptDescriptorAttribute::new(DescriptorType::InterruptGate, 0, false, 0),
        offset_middle: 0,
        offset_high: 0,
        reserved: 0,
    };

    pub const fn handler_address(&self) -> u64 {
        (self.offset_low as u64)
            | ((self.offset_middle as u64) << 16)
            | ((self.offset_high as u64) << 32)
    }

    pub const fn segment_selector(&self) -> u16 {
        self.segment_selector
    }

    pub const fn attributes(&self) -> InterruptDescriptorAttribute {
        self.attr
    }
}

// `present = false` describes a vector that is left unarmed.
pub const fn interrupt_gate(
    handler_address: u64,
    segment_selector: u16,
    gate_type: DescriptorType,
    privilege_level: u8,
    present: bool,
    stack_index: u8,
) -> InterruptDescriptor {
    InterruptDescriptor {
        offset_low: (handler_address & 0xffff) as u16,
        segment_selector,
        attr: InterruptDescriptorAttribute::new(gate_type, privilege_level, present, stack_index),
        offset_middle: ((handler_address >> 16) & 0xffff) as u16,
        offset_high: (handler_address >> 32) as u32,
        reserved: 0,
    }
}
