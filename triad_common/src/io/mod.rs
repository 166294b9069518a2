//! Logical pin model and process-wide pin registry.
//!
//! A [`pin::IoPin`] wraps a platform [`pin::PinBackend`] with the two
//! orthogonal policy flags every driven line carries: read/write inversion
//! and a declared safe default state. Every live pin is tracked by the
//! [`registry`], which drives all of them back to their defaults on any
//! exit path.

pub mod pin;
pub mod registry;
pub mod sim;

pub use pin::{DefaultState, IoPin, Level, PinBackend, PinSpec};
pub use registry::deactivate_all;
