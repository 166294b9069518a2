//! Logical pin wrapper: inversion policy and safe default state.
//!
//! The wrapper takes the burden of inversions off the platform backends:
//! callers always see logical levels, and `translate_write` /
//! `translate_read` map between the logical and primitive domains.

use std::fmt;
use std::ops::Not;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::registry;

// ─── Levels and Defaults ────────────────────────────────────────────

/// Digital line level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Not for Level {
    type Output = Level;

    #[inline]
    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Declared safe state a pin returns to on shutdown.
///
/// `HighZ` releases the line entirely (input mode) — used for sensor pins
/// that must not source current once the process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultState {
    #[default]
    Low,
    High,
    HighZ,
}

/// Per-pin policy: hardware pin number, inversion flags, default state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    /// BCM pin number.
    pub pin: u8,
    /// Invert logical reads (active-low inputs).
    #[serde(default)]
    pub invert_reads: bool,
    /// Invert logical writes (active-low outputs).
    #[serde(default)]
    pub invert_writes: bool,
    /// State the primitive pin is driven to at shutdown.
    #[serde(default)]
    pub default_state: DefaultState,
}

impl PinSpec {
    /// A plain active-high output/input with default LOW.
    pub const fn plain(pin: u8) -> Self {
        Self {
            pin,
            invert_reads: false,
            invert_writes: false,
            default_state: DefaultState::Low,
        }
    }
}

// ─── Backend Trait ──────────────────────────────────────────────────

/// Platform-primitive pin operations.
///
/// Implemented by the memory-mapped GPIO backend on real hardware and by
/// [`super::sim::SimPin`] in tests. All levels here are primitive —
/// inversion has already been applied by the wrapper.
pub trait PinBackend: Send {
    /// Switch the pin to output mode, driving `level` in the same
    /// operation so the line never floats through an undefined state.
    fn make_output(&mut self, level: Level);

    /// Switch the pin to input (high impedance) mode.
    fn make_input(&mut self);

    /// Read the primitive line level.
    fn read_level(&mut self) -> Level;

    /// Drive the primitive line level (pin must be in output mode).
    fn write_level(&mut self, level: Level);
}

// ─── IoPin ──────────────────────────────────────────────────────────

/// A registered logical pin.
///
/// Construction registers the pin with the process-wide registry; drop
/// drives the primitive pin to its default state and deregisters. The
/// registry entry is keyed by an id, so moving an `IoPin` between owners
/// never disturbs its membership.
pub struct IoPin {
    id: u64,
    spec: PinSpec,
    backend: Arc<Mutex<dyn PinBackend>>,
}

impl fmt::Debug for IoPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPin")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl IoPin {
    /// Wrap a backend with the given policy and register it.
    pub fn new(spec: PinSpec, backend: impl PinBackend + 'static) -> Self {
        let backend: Arc<Mutex<dyn PinBackend>> = Arc::new(Mutex::new(backend));
        let id = registry::register(spec, Arc::clone(&backend));
        Self { id, spec, backend }
    }

    /// The pin's policy spec.
    #[inline]
    pub const fn spec(&self) -> PinSpec {
        self.spec
    }

    /// Map a logical write level to the primitive domain.
    #[inline]
    pub fn translate_write(&self, level: Level) -> Level {
        if self.spec.invert_writes {
            !level
        } else {
            level
        }
    }

    /// Map a primitive read level to the logical domain.
    #[inline]
    pub fn translate_read(&self, level: Level) -> Level {
        if self.spec.invert_reads {
            !level
        } else {
            level
        }
    }

    /// Map a logical PWM duty cycle to the primitive domain.
    #[inline]
    pub fn translate_duty(&self, duty: f64) -> f64 {
        if self.spec.invert_writes {
            1.0 - duty
        } else {
            duty
        }
    }

    /// Configure as output and drive the logical `level`.
    pub fn make_output(&mut self, level: Level) {
        let primitive = self.translate_write(level);
        self.lock_backend().make_output(primitive);
    }

    /// Configure as input.
    pub fn make_input(&mut self) {
        self.lock_backend().make_input();
    }

    /// Read the logical level.
    pub fn digital_read(&mut self) -> Level {
        let primitive = self.lock_backend().read_level();
        self.translate_read(primitive)
    }

    /// Write the logical level.
    pub fn digital_write(&mut self, level: Level) {
        let primitive = self.translate_write(level);
        self.lock_backend().write_level(primitive);
    }

    /// Drive the primitive pin to its declared default state.
    pub fn set_to_default(&mut self) {
        registry::drive_default(self.spec, &mut *self.lock_backend());
    }

    fn lock_backend(&self) -> std::sync::MutexGuard<'_, dyn PinBackend + 'static> {
        match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for IoPin {
    fn drop(&mut self) {
        self.set_to_default();
        registry::deregister(self.id);
    }
}
