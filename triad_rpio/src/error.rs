//! Error types for register-level I/O and physical memory management.

use thiserror::Error;

/// Errors from `/dev/mem` mapping and pinned-page management.
#[derive(Debug, Error)]
pub enum RpioError {
    /// File or mapping I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Page-aligned allocation failed.
    #[error("failed to allocate a pinned page")]
    AllocFailed,

    /// `mlock` refused the page.
    #[error("mlock failed: {0}")]
    Mlock(nix::Error),

    /// The pagemap entry reports the page as not present.
    #[error("pagemap entry for virtual address {virt:#x} is not present")]
    PageNotPresent {
        /// Virtual address queried.
        virt: usize,
    },

    /// Physical address does not fit the 32-bit DMA address space.
    #[error("physical address {phys:#x} is beyond the DMA-addressable range")]
    BeyondDmaRange {
        /// Physical address obtained from pagemap.
        phys: u64,
    },
}
