//! Pinned physical pages for DMA.
//!
//! The DMA engine sees bus-physical addresses while the CPU sees virtual
//! ones, so every DMA-visible allocation is kept as a (virtual, physical)
//! pair. A page is allocated page-aligned, faulted in by a dummy write,
//! locked with `mlock` so the kernel can never migrate it, and its frame
//! number read from `/proc/self/pagemap`. Pages are never released while
//! motion is active; the emitter holds them for its whole lifetime.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ptr::NonNull;

use tracing::debug;

use triad_common::consts::PAGE_SIZE;

use crate::error::RpioError;

/// Pagemap entry bit: page present in RAM.
const PAGEMAP_PRESENT: u64 = 1 << 63;

/// Pagemap entry mask: page frame number (bits 0–54).
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// One locked, physically resolved page of RAM.
pub struct PinnedPage {
    virt: NonNull<u8>,
    bus: u32,
}

// Exclusive ownership of the allocation; handed between threads whole.
unsafe impl Send for PinnedPage {}

impl PinnedPage {
    /// Allocate, fault in, lock, and physically resolve one page.
    pub fn new() -> Result<Self, RpioError> {
        let layout = Self::layout();
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(virt) = NonNull::new(ptr) else {
            return Err(RpioError::AllocFailed);
        };

        unsafe {
            // Force the page into RAM before locking, then undo the probe
            // so the page stays zero-filled.
            virt.as_ptr().write_volatile(1);
            if let Err(e) = nix::sys::mman::mlock(virt.cast(), PAGE_SIZE) {
                dealloc(virt.as_ptr(), layout);
                return Err(RpioError::Mlock(e));
            }
            virt.as_ptr().write_volatile(0);
        }

        let phys = match physical_address(virt.as_ptr() as usize) {
            Ok(phys) => phys,
            Err(e) => {
                unsafe {
                    let _ = nix::sys::mman::munlock(virt.cast(), PAGE_SIZE);
                    dealloc(virt.as_ptr(), layout);
                }
                return Err(e);
            }
        };
        if phys > u32::MAX as u64 {
            unsafe {
                let _ = nix::sys::mman::munlock(virt.cast(), PAGE_SIZE);
                dealloc(virt.as_ptr(), layout);
            }
            return Err(RpioError::BeyondDmaRange { phys });
        }

        debug!(
            virt = format_args!("{:p}", virt.as_ptr()),
            phys = format_args!("{phys:#x}"),
            "pinned page"
        );
        Ok(Self { virt, bus: phys as u32 })
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("page layout is valid")
    }

    /// CPU-visible base of the page.
    #[inline]
    pub fn virt_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// DMA-visible address of `offset` bytes into the page.
    #[inline]
    pub fn bus_addr(&self, offset: usize) -> u32 {
        debug_assert!(offset < PAGE_SIZE);
        self.bus + offset as u32
    }

    /// Volatile write of a 32-bit word at `word` index.
    #[inline]
    pub fn write_u32(&self, word: usize, value: u32) {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { (self.virt.as_ptr() as *mut u32).add(word).write_volatile(value) }
    }

    /// Volatile read of a 32-bit word at `word` index.
    #[inline]
    pub fn read_u32(&self, word: usize) -> u32 {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { (self.virt.as_ptr() as *const u32).add(word).read_volatile() }
    }

    /// Volatile write of `bytes` starting at byte `offset`.
    ///
    /// Used to install whole control blocks; the caller orders the
    /// subsequent chain-pointer store with a release fence.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= PAGE_SIZE);
        let base = self.virt.as_ptr();
        for (i, b) in bytes.iter().enumerate() {
            unsafe { base.add(offset + i).write_volatile(*b) }
        }
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munlock(self.virt.cast(), PAGE_SIZE);
            dealloc(self.virt.as_ptr(), Self::layout());
        }
    }
}

/// Resolve a virtual address to its physical address via
/// `/proc/self/pagemap`: one 8-byte little-endian entry per page, indexed
/// by `virt / PAGE_SIZE`.
fn physical_address(virt: usize) -> Result<u64, RpioError> {
    let mut pagemap = File::open("/proc/self/pagemap")?;
    pagemap.seek(SeekFrom::Start((virt / PAGE_SIZE) as u64 * 8))?;
    let mut entry_bytes = [0u8; 8];
    pagemap.read_exact(&mut entry_bytes)?;
    let entry = u64::from_le_bytes(entry_bytes);
    if entry & PAGEMAP_PRESENT == 0 {
        return Err(RpioError::PageNotPresent { virt });
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    Ok(pfn * PAGE_SIZE as u64 + (virt % PAGE_SIZE) as u64)
}
