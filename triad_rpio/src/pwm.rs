//! PWM peripheral as a DMA pacing clock.
//!
//! The PWM block consumes FIFO data at a configurable rate and raises its
//! DREQ line whenever it can accept more. Pairing a DMA channel with
//! PERMAP=PWM and DEST_DREQ gates every transfer on that line, giving
//! per-transfer pacing at a known frequency. The pulse chain never feeds
//! the FIFO itself — the block free-runs in serializer mode on repeated
//! data, and only its consumption cadence matters.
//!
//! The PWM source clock is taken as configured by firmware bring-up;
//! `range` divides it down to one DREQ per pacing tick.

use tracing::debug;

use crate::devmem::{DevMem, PeripheralMap};
use crate::error::RpioError;
use crate::PWM_OFFSET;

// Word offsets within the PWM page.
const PWM_CTL: usize = 0x00 / 4;
const PWM_DMAC: usize = 0x08 / 4;
const PWM_RNG1: usize = 0x10 / 4;
const PWM_FIF1: usize = 0x18 / 4;

// CTL bits.
const CTL_PWEN1: u32 = 1 << 0;
const CTL_MODE1_SERIALIZER: u32 = 1 << 1;
const CTL_RPTL1: u32 = 1 << 2;
const CTL_USEF1: u32 = 1 << 5;
const CTL_CLRF1: u32 = 1 << 6;

// DMAC bits.
const DMAC_ENAB: u32 = 1 << 31;
const DMAC_PANIC_DREQ_DEFAULT: u32 = (7 << 8) | 7;

/// Live PWM pacer window.
pub struct PwmPacer {
    regs: PeripheralMap,
}

impl PwmPacer {
    pub fn new(devmem: &DevMem, periph_base_phys: u32) -> Result<Self, RpioError> {
        let regs = devmem.map_peripheral(periph_base_phys + PWM_OFFSET)?;
        Ok(Self { regs })
    }

    /// Configure channel 1 to consume one word every `range` source-clock
    /// cycles and assert DREQ at that cadence.
    pub fn configure(&self, range: u32) {
        // Stop, drain the FIFO, program the consumption rate.
        self.regs.write_reg(PWM_CTL, 0);
        self.regs.write_reg(PWM_CTL, CTL_CLRF1);
        self.regs.write_reg(PWM_RNG1, range);
        self.regs.write_reg(PWM_DMAC, DMAC_ENAB | DMAC_PANIC_DREQ_DEFAULT);
        // Seed one word so the serializer has data to repeat.
        self.regs.write_reg(PWM_FIF1, 0);
        self.regs.write_reg(
            PWM_CTL,
            CTL_PWEN1 | CTL_MODE1_SERIALIZER | CTL_RPTL1 | CTL_USEF1,
        );
        debug!(range, "PWM pacer configured");
    }

    /// Stop the pacer.
    pub fn stop(&self) {
        self.regs.write_reg(PWM_CTL, 0);
    }
}
