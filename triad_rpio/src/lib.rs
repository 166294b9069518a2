//! # Triad RPi I/O Library
//!
//! Register-level access to the BCM2835-class peripherals the motion core
//! drives: `/dev/mem` peripheral windows, pinned physical pages for DMA,
//! the GPIO block, the 1 MHz system timer, and the DMA pulse emitter that
//! turns merged step events into hardware-timed GPIO transitions.
//!
//! Everything here except [`chain`] touches hardware and needs root; the
//! chain synthesis is pure and carries the timing contract tests.

pub mod chain;
pub mod devmem;
pub mod dma;
pub mod emit;
pub mod error;
pub mod gpio;
pub mod phys;
pub mod pwm;
pub mod timer;

pub use chain::{CbTemplate, CbWrite, ChainSynth, GpioEvent};
pub use devmem::{DevMem, PeripheralMap};
pub use emit::{EmitterError, PulseEmitter};
pub use error::RpioError;
pub use gpio::{Gpio, GpioPin};
pub use phys::PinnedPage;
pub use timer::SystemTimer;

/// Physical base of the BCM2835 peripheral window.
/// (0x3F00_0000 on the BCM2836/7; configurable at machine bring-up.)
pub const PERIPH_BASE_PHYS: u32 = 0x2000_0000;

/// Peripheral offsets from the peripheral window base.
pub const TIMER_OFFSET: u32 = 0x0000_3000;
pub const DMA_OFFSET: u32 = 0x0000_7000;
pub const GPIO_OFFSET: u32 = 0x0020_0000;
pub const PWM_OFFSET: u32 = 0x0020_C000;

/// Bus-address alias of the peripheral window, as seen by the DMA engine.
pub const PERIPH_BASE_BUS: u32 = 0x7E00_0000;
