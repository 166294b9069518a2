//! `/dev/mem` peripheral windows.
//!
//! Linux gives each process virtual memory; the peripheral registers live
//! at fixed physical addresses. `/dev/mem` behaves as a file over physical
//! memory, so mapping a page of it at a peripheral's base yields a live
//! register window. Requires root.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use triad_common::consts::PAGE_SIZE;

use crate::error::RpioError;

/// Handle on the opened `/dev/mem` device.
pub struct DevMem {
    file: File,
}

impl DevMem {
    /// Open `/dev/mem` with synchronous (uncached) access.
    pub fn open() -> Result<Self, RpioError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")?;
        Ok(Self { file })
    }

    /// Map one page of registers at the given physical address.
    pub fn map_peripheral(&self, phys_addr: u32) -> Result<PeripheralMap, RpioError> {
        let map = unsafe {
            MmapOptions::new()
                .offset(phys_addr as u64)
                .len(PAGE_SIZE)
                .map_mut(&self.file)?
        };
        debug!(phys = format_args!("{phys_addr:#x}"), "peripheral mapped");
        Ok(PeripheralMap::new(map))
    }
}

/// A mapped page of peripheral registers with volatile word access.
pub struct PeripheralMap {
    base: *mut u32,
    _map: MmapMut,
}

// The mapping is MMIO: every access is volatile and the hardware orders
// same-peripheral accesses itself. Sharing read/write handles across the
// producer and temperature threads is part of the register contract.
unsafe impl Send for PeripheralMap {}
unsafe impl Sync for PeripheralMap {}

impl PeripheralMap {
    fn new(mut map: MmapMut) -> Self {
        let base = map.as_mut_ptr() as *mut u32;
        Self { base, _map: map }
    }

    /// Volatile read of the 32-bit register at `word` offset.
    #[inline]
    pub fn read_reg(&self, word: usize) -> u32 {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { self.base.add(word).read_volatile() }
    }

    /// Volatile write of the 32-bit register at `word` offset.
    #[inline]
    pub fn write_reg(&self, word: usize, value: u32) {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { self.base.add(word).write_volatile(value) }
    }

    /// Read-modify-write under `mask`: bits outside the mask keep their
    /// current value.
    #[inline]
    pub fn write_masked(&self, word: usize, mask: u32, value: u32) {
        let current = self.read_reg(word);
        self.write_reg(word, (current & !mask) | (value & mask));
    }
}
