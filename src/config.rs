use crate::log::LogLevel;

// Build-time kernel settings. There is no command line to read at this stage of boot, so
// everything tunable lives here and in cargo features.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub log_level: LogLevel,
    // capacity of the queue between interrupt handlers and the dispatch loop
    pub main_queue_capacity: usize,
    pub heap_start: usize,
    pub heap_size: usize,
    // how much of the xHC's BAR0 to identity-map
    pub xhc_mmio_window: u64,
    pub xhc_vector: u8,
    // the xHC may claim 2^exponent contiguous vectors
    pub xhc_msi_vector_exponent: u8,
}

pub const CONFIG: KernelConfig = KernelConfig {
    log_level: if cfg!(feature = "verbose") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    },
    main_queue_capacity: 32,
    heap_start: 0x_4444_4444_0000,
    heap_size: 100 * 1024,
    xhc_mmio_window: 64 * 1024,
    xhc_vector: 0x40,
    xhc_msi_vector_exponent: 0,
};
