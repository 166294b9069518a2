//! GPIO register block.
//!
//! Register contract (offsets from the GPIO base):
//! GPFSEL0..5 at 0x00..0x14 (3 bits per pin: 000 input, 001 output),
//! GPSET0/1 at 0x1C/0x20, GPCLR0/1 at 0x28/0x2C, GPLEV0 at 0x34,
//! GPPUD/GPPUDCLK0 at 0x94/0x98 for the pull-resistor strobe sequence.
//!
//! Writing a 1 to bit N of GPSET0 drives pin N high; writing 0 has no
//! effect — which is what makes the set/clear registers safe targets for
//! both CPU writes and DMA writes without read-modify-write races.

use std::sync::Arc;
use std::time::Duration;

use triad_common::config::PullMode;
use triad_common::io::{Level, PinBackend};

use crate::devmem::{DevMem, PeripheralMap};
use crate::error::RpioError;
use crate::{GPIO_OFFSET, PERIPH_BASE_BUS};

// Word offsets within the GPIO page.
const GPFSEL0: usize = 0x00 / 4;
const GPSET0: usize = 0x1C / 4;
const GPCLR0: usize = 0x28 / 4;
const GPLEV0: usize = 0x34 / 4;
const GPPUD: usize = 0x94 / 4;
const GPPUDCLK0: usize = 0x98 / 4;

/// Bus address of the GPIO block, for DMA destinations.
pub const GPIO_BUS_BASE: u32 = PERIPH_BASE_BUS + GPIO_OFFSET;

/// Bus address of GPSET0.
pub const GPSET0_BUS: u32 = GPIO_BUS_BASE + 0x1C;

/// Bus address of GPCLR0.
pub const GPCLR0_BUS: u32 = GPIO_BUS_BASE + 0x28;

/// Pin function select values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Function {
    Input = 0b000,
    Output = 0b001,
}

/// Live GPIO register window.
pub struct Gpio {
    regs: PeripheralMap,
}

impl Gpio {
    /// Map the GPIO block from an opened `/dev/mem`.
    pub fn new(devmem: &DevMem, periph_base_phys: u32) -> Result<Self, RpioError> {
        let regs = devmem.map_peripheral(periph_base_phys + GPIO_OFFSET)?;
        Ok(Self { regs })
    }

    /// Select a pin's function (3 bits per pin, 10 pins per register).
    pub fn set_function(&self, pin: u8, function: Function) {
        let reg = GPFSEL0 + pin as usize / 10;
        let shift = (pin as usize % 10) * 3;
        self.regs.write_masked(reg, 0b111 << shift, (function as u32) << shift);
    }

    /// Drive a pin high via GPSET0.
    #[inline]
    pub fn set_high(&self, pin: u8) {
        self.regs.write_reg(GPSET0, 1 << pin);
    }

    /// Drive a pin low via GPCLR0.
    #[inline]
    pub fn set_low(&self, pin: u8) {
        self.regs.write_reg(GPCLR0, 1 << pin);
    }

    /// Read a pin's level from GPLEV0.
    #[inline]
    pub fn level(&self, pin: u8) -> Level {
        if self.regs.read_reg(GPLEV0) & (1 << pin) != 0 {
            Level::High
        } else {
            Level::Low
        }
    }

    /// Strobe a pull resistor setting into a pin.
    ///
    /// The datasheet sequence: write the control value, wait for the
    /// control signal to settle, clock it into the pin, wait again, then
    /// clear both registers.
    pub fn set_pull(&self, pin: u8, pull: PullMode) {
        let control = match pull {
            PullMode::Off => 0,
            PullMode::Down => 1,
            PullMode::Up => 2,
        };
        self.regs.write_reg(GPPUD, control);
        std::thread::sleep(Duration::from_micros(5));
        self.regs.write_reg(GPPUDCLK0, 1 << pin);
        std::thread::sleep(Duration::from_micros(5));
        self.regs.write_reg(GPPUD, 0);
        self.regs.write_reg(GPPUDCLK0, 0);
    }
}

/// One hardware pin as a [`PinBackend`], for the logical pin wrapper.
pub struct GpioPin {
    gpio: Arc<Gpio>,
    pin: u8,
}

impl GpioPin {
    pub fn new(gpio: Arc<Gpio>, pin: u8) -> Self {
        Self { gpio, pin }
    }
}

impl PinBackend for GpioPin {
    fn make_output(&mut self, level: Level) {
        // Latch the level first so the pin never glitches through the
        // opposite state when the function switches.
        match level {
            Level::High => self.gpio.set_high(self.pin),
            Level::Low => self.gpio.set_low(self.pin),
        }
        self.gpio.set_function(self.pin, Function::Output);
    }

    fn make_input(&mut self) {
        self.gpio.set_function(self.pin, Function::Input);
    }

    fn read_level(&mut self) -> Level {
        self.gpio.level(self.pin)
    }

    fn write_level(&mut self, level: Level) {
        match level {
            Level::High => self.gpio.set_high(self.pin),
            Level::Low => self.gpio.set_low(self.pin),
        }
    }
}
