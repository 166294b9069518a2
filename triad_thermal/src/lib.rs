//! # Triad Thermal Library
//!
//! Closed-loop hotend temperature control: RC-discharge thermistor
//! readout, one-pole low-pass conditioning, a PID with integral cap, and
//! the slow-PWM heater loop with thermistor-fault and heater-runaway
//! supervision.

pub mod control;
pub mod filter;
pub mod pid;
pub mod rctherm;

pub use control::{TempControl, ThermalError};
pub use filter::LowPass;
pub use pid::{pid_compute, PidGains, PidState};
pub use rctherm::{FaultKind, RcThermistor, RcThermistorParams, SampleOutcome};
