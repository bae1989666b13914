/**
 * Local APIC registers used by the bring-up path, and the legacy 8259 PIC, which is only
 * touched to get it out of the way.
 *
 * The local APIC page must be identity-mapped (see `crate::memory::identity_map`) before
 * any of these are called.
 */

use pic8259::ChainedPics;
use volatile::Volatile;

use crate::interrupts::SPURIOUS_VECTOR;

pub const LOCAL_APIC_BASE: u64 = 0xfee0_0000;
pub const LOCAL_APIC_SIZE: u64 = 0x1000;

const ID_REGISTER: u64 = LOCAL_APIC_BASE + 0x20;
const END_OF_INTERRUPT_REGISTER: u64 = LOCAL_APIC_BASE + 0xb0;
const SPURIOUS_VECTOR_REGISTER: u64 = LOCAL_APIC_BASE + 0xf0;
const APIC_SOFTWARE_ENABLE: u32 = 1 << 8;

// legacy PIC lines would otherwise land on the CPU exception vectors
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

unsafe fn register(address: u64) -> &'static mut Volatile<u32> {
    &mut *(address as *mut Volatile<u32>)
}

// The ID of the local APIC of the executing CPU (bits 31:24 of the ID register).
pub fn local_apic_id() -> u8 {
    let id = unsafe { register(ID_REGISTER) }.read();
    (id >> 24) as u8
}

// Signals end-of-interrupt: a single write to the EOI register. Safe in interrupt context.
pub fn notify_end_of_interrupt() {
    unsafe { register(END_OF_INTERRUPT_REGISTER) }.write(0);
}

pub fn enable_local_apic() {
    let svr = unsafe { register(SPURIOUS_VECTOR_REGISTER) };
    let value = svr.read();
    svr.write((value & !0xff) | APIC_SOFTWARE_ENABLE | SPURIOUS_VECTOR as u32);
}

// Remaps the 8259 pair away from the exception vectors and masks every line, leaving
// message-signaled interrupts as the only external interrupt source.
pub fn disable_legacy_pic() {
    let mut pics = unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) };
    unsafe {
        pics.initialize();
        pics.write_masks(0xff, 0xff);
    }
}
