//! DMA channel registers and control-block layout.
//!
//! Each channel occupies a 0x100-byte stride from the DMA base: CS at
//! +0x00, CONBLK_AD at +0x04, the loaded control-block mirror at
//! +0x08..+0x1C, and DEBUG at +0x20. DMAENABLE sits at +0xFF0. A control
//! block is a 32-byte record the engine reads from bus memory; its
//! NEXTCONBK pointer chains blocks into a linked list and must be
//! 32-byte aligned or zero (terminator).

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert_eq};
use tracing::{debug, warn};

use crate::devmem::{DevMem, PeripheralMap};
use crate::error::RpioError;
use crate::DMA_OFFSET;

// ─── Register bits ──────────────────────────────────────────────────

bitflags! {
    /// Channel CS (control and status) bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CsFlags: u32 {
        /// Engine is running the installed chain.
        const ACTIVE = 1 << 0;
        /// Current control block finished; write 1 to clear.
        const END = 1 << 1;
        /// Interrupt raised by an INTEN block; write 1 to clear.
        const INT = 1 << 2;
        /// Error latched; details in DEBUG.
        const ERROR = 1 << 8;
        /// Reset the channel.
        const RESET = 1 << 31;
    }
}

bitflags! {
    /// Channel DEBUG error bits; write 1 to clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const READ_LAST_NOT_SET_ERROR = 1 << 0;
        const FIFO_ERROR = 1 << 1;
        const READ_ERROR = 1 << 2;
    }
}

bitflags! {
    /// Control-block TI (transfer information) bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TiFlags: u32 {
        /// Raise INT when this block completes.
        const INTEN = 1 << 0;
        /// Wait for the write response on each transfer.
        const WAIT_RESP = 1 << 3;
        /// Increment the destination address per transfer.
        const DEST_INC = 1 << 4;
        /// Gate writes on the PERMAP peripheral's DREQ.
        const DEST_DREQ = 1 << 6;
        /// Increment the source address per transfer.
        const SRC_INC = 1 << 8;
        /// Gate reads on the PERMAP peripheral's DREQ.
        const SRC_DREQ = 1 << 10;
        /// Never issue wide bursts.
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

/// PERMAP value selecting the PWM peripheral's DREQ for pacing.
pub const PERMAP_PWM: u32 = 5;

/// Largest inter-transfer wait the 5-bit WAITS field can hold.
pub const MAX_WAITS: u32 = 31;

/// Encode a PERMAP peripheral number into TI bits 16..20.
#[inline]
pub const fn ti_permap(peripheral: u32) -> u32 {
    (peripheral & 0x1F) << 16
}

/// Encode inter-transfer wait cycles into TI bits 21..25 (max 31).
#[inline]
pub const fn ti_waits(cycles: u32) -> u32 {
    (cycles & 0x1F) << 21
}

// ─── Control block ──────────────────────────────────────────────────

/// One 32-byte DMA control block.
///
/// All addresses are bus-physical; the engine cannot follow virtual
/// pointers.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct DmaControlBlock {
    /// Transfer information flags.
    pub ti: u32,
    /// Source bus address.
    pub source_ad: u32,
    /// Destination bus address.
    pub dest_ad: u32,
    /// Transfer length [bytes].
    pub txfr_len: u32,
    /// 2D stride (unused: linear transfers only).
    pub stride: u32,
    /// Next control block bus address; 0 terminates the chain.
    pub nextconbk: u32,
    _reserved: [u32; 2],
}

assert_eq_size!(DmaControlBlock, [u8; 32]);
const_assert_eq!(std::mem::align_of::<DmaControlBlock>(), 32);

impl DmaControlBlock {
    /// Serialize for a volatile copy into a pinned page.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, field) in [
            self.ti,
            self.source_ad,
            self.dest_ad,
            self.txfr_len,
            self.stride,
            self.nextconbk,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
        out
    }
}

// ─── Channel registers ──────────────────────────────────────────────

// Per-channel word offsets.
const REG_CS: usize = 0x00 / 4;
const REG_CONBLK_AD: usize = 0x04 / 4;
const REG_DEBUG: usize = 0x20 / 4;

// Global enable register.
const REG_ENABLE: usize = 0xFF0 / 4;

/// One claimed DMA channel.
pub struct DmaChannel {
    regs: PeripheralMap,
    channel: u8,
    base_word: usize,
}

impl DmaChannel {
    /// Map the DMA block and select a channel (0x100-byte stride).
    pub fn new(devmem: &DevMem, periph_base_phys: u32, channel: u8) -> Result<Self, RpioError> {
        debug_assert!(channel <= 14);
        let regs = devmem.map_peripheral(periph_base_phys + DMA_OFFSET)?;
        Ok(Self {
            regs,
            channel,
            base_word: channel as usize * (0x100 / 4),
        })
    }

    /// Set this channel's bit in DMAENABLE.
    pub fn enable(&self) {
        let bit = 1u32 << self.channel;
        self.regs.write_masked(REG_ENABLE, bit, bit);
        debug!(channel = self.channel, "DMA channel enabled");
    }

    #[inline]
    pub fn cs(&self) -> CsFlags {
        CsFlags::from_bits_retain(self.regs.read_reg(self.base_word + REG_CS))
    }

    #[inline]
    pub fn set_cs(&self, flags: CsFlags) {
        self.regs.write_reg(self.base_word + REG_CS, flags.bits());
    }

    /// The engine's current control-block bus address (0 when parked).
    #[inline]
    pub fn conblk_ad(&self) -> u32 {
        self.regs.read_reg(self.base_word + REG_CONBLK_AD)
    }

    #[inline]
    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags::from_bits_truncate(self.regs.read_reg(self.base_word + REG_DEBUG))
    }

    /// Clear the sticky DEBUG error bits.
    pub fn clear_debug_flags(&self) {
        self.regs.write_reg(
            self.base_word + REG_DEBUG,
            (DebugFlags::READ_ERROR | DebugFlags::FIFO_ERROR | DebugFlags::READ_LAST_NOT_SET_ERROR)
                .bits(),
        );
    }

    /// Install a chain head and start the engine.
    pub fn activate(&self, head_bus: u32) {
        self.regs.write_reg(self.base_word + REG_CONBLK_AD, head_bus);
        self.set_cs(CsFlags::ACTIVE);
        debug!(channel = self.channel, head = format_args!("{head_bus:#x}"), "DMA active");
    }

    /// Reset the channel and wait for ACTIVE to clear.
    pub fn reset(&self) {
        self.set_cs(CsFlags::RESET);
        for _ in 0..1_000_000 {
            if !self.cs().contains(CsFlags::ACTIVE) {
                return;
            }
            std::hint::spin_loop();
        }
        warn!(channel = self.channel, "DMA channel did not go inactive after reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_field_offsets() {
        // The engine reads the block by fixed field positions.
        let cb = DmaControlBlock {
            ti: 0x1111_1111,
            source_ad: 0x2222_2222,
            dest_ad: 0x3333_3333,
            txfr_len: 4,
            stride: 0,
            nextconbk: 0x4444_4440,
            _reserved: [0; 2],
        };
        let bytes = cb.to_bytes();
        assert_eq!(&bytes[0..4], &0x1111_1111u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x3333_3333u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0x4444_4440u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &[0u8; 8]);
    }

    #[test]
    fn ti_field_encodings() {
        assert_eq!(ti_permap(PERMAP_PWM), 5 << 16);
        assert_eq!(ti_waits(31), 31 << 21);
        // WAITS saturation is the synthesizer's job; encoding truncates.
        assert_eq!(ti_waits(32), 0);
        assert_eq!(TiFlags::DEST_DREQ.bits(), 1 << 6);
        assert_eq!(TiFlags::NO_WIDE_BURSTS.bits(), 1 << 26);
    }
}
