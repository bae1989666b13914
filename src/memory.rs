use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        mapper::MapToError, FrameAllocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

// Frame allocator created from the memory map provided by the BootInfo struct from the
// bootloader.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    // This function is unsafe because the caller has to guarantee that the `USABLE` memory regions
    // given by the memory map are in fact usable.
    pub unsafe fn init(mmap: &'static MemoryMap) -> Self {
        BootInfoFrameAllocator {
            memory_map: mmap,
            next: 0,
        }
    }

    pub fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        self.memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .map(|r| r.range.start_addr()..r.range.end_addr())
            .flat_map(|range| range.step_by(4096))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    // hands out page table frames when a mapping needs a table that does not exist yet
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

// Initialize a new OffsetPageTable
//
// This function is unsafe because the caller must guarantee that the
// complete physical memory is mapped to virtual memory at the passed
// `physical_memory_offset`. Also, this function must be only called once
// to avoid aliasing `&mut` references (which is undefined behavior).
pub unsafe fn init(phy_mem_offset: VirtAddr) -> OffsetPageTable<'static> {
    let l4_pt = active_level4_page_table(phy_mem_offset);
    OffsetPageTable::new(l4_pt, phy_mem_offset)
}

unsafe fn active_level4_page_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level4_pagetable_frame, _) = Cr3::read();
    let p4_phy_addr = physical_memory_offset + level4_pagetable_frame.start_address().as_u64();
    let p4_pointer: *mut PageTable = p4_phy_addr.as_mut_ptr();
    &mut *p4_pointer
}

// Maps the physical range [phys_start, phys_start + size) at the numerically equal virtual
// address, uncached. Device registers (local APIC, PCI BARs) sit outside the physical memory
// window the bootloader maps, so drivers reach them through these identity pages. A page that
// is already mapped is left as it is.
//
// This function is unsafe because the caller must guarantee that the range is device memory
// and that nothing else occupies those virtual addresses.
pub unsafe fn identity_map(
    mapper: &mut impl Mapper<Size4KiB>,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    phys_start: u64,
    size: u64,
) -> Result<(), MapToError<Size4KiB>> {
    if size == 0 {
        return Ok(());
    }
    let first = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(phys_start));
    let last = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(phys_start + size - 1));
    let flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::NO_CACHE
        | PageTableFlags::WRITE_THROUGH;

    for frame in PhysFrame::range_inclusive(first, last) {
        let virt = VirtAddr::new(frame.start_address().as_u64());
        let page = Page::<Size4KiB>::containing_address(virt);
        match mapper.map_to(page, frame, flags, frame_allocator) {
            Ok(flush) => flush.flush(),
            Err(MapToError::PageAlreadyMapped(_)) | Err(MapToError::ParentEntryHugePage) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
