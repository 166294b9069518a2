//! Free-running 1 MHz system timer.
//!
//! 64 bits split over two registers: low word at +0x04, high word at
//! +0x08. The high word is read twice around the low word to guard
//! against tearing at the 32-bit rollover.

use crate::devmem::{DevMem, PeripheralMap};
use crate::error::RpioError;
use crate::TIMER_OFFSET;

const TIMER_CLO: usize = 0x04 / 4;
const TIMER_CHI: usize = 0x08 / 4;

/// Live system-timer window.
pub struct SystemTimer {
    regs: PeripheralMap,
}

impl SystemTimer {
    pub fn new(devmem: &DevMem, periph_base_phys: u32) -> Result<Self, RpioError> {
        let regs = devmem.map_peripheral(periph_base_phys + TIMER_OFFSET)?;
        Ok(Self { regs })
    }

    /// Current timer value [µs since boot].
    pub fn now_us(&self) -> u64 {
        loop {
            let hi = self.regs.read_reg(TIMER_CHI);
            let lo = self.regs.read_reg(TIMER_CLO);
            if self.regs.read_reg(TIMER_CHI) == hi {
                return (hi as u64) << 32 | lo as u64;
            }
        }
    }
}
