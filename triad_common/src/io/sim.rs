//! Simulated pin backend.
//!
//! Stands in for the memory-mapped GPIO backend in tests and on hosts
//! without the Pi peripherals. The observable line state lives behind a
//! shared handle so a test can drive inputs and inspect outputs while the
//! pin itself is owned by the code under test.

use std::sync::{Arc, Mutex};

use super::pin::{Level, PinBackend};

/// Pin direction as seen at the primitive level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Input,
    Output,
}

#[derive(Debug)]
struct Inner {
    mode: SimMode,
    /// Level driven while in output mode.
    driven: Level,
    /// Level presented to reads while in input mode.
    input: Level,
}

/// Shared observer/driver handle for a [`SimPin`].
#[derive(Debug, Clone)]
pub struct SimState(Arc<Mutex<Inner>>);

impl SimState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The primitive level currently driven (output mode).
    pub fn level(&self) -> Level {
        self.lock().driven
    }

    /// Current pin direction.
    pub fn mode(&self) -> SimMode {
        self.lock().mode
    }

    /// Present `level` to subsequent reads in input mode.
    pub fn set_input_level(&self, level: Level) {
        self.lock().input = level;
    }
}

/// Simulated primitive pin.
#[derive(Debug)]
pub struct SimPin {
    state: SimState,
}

impl SimPin {
    pub fn new() -> Self {
        Self {
            state: SimState(Arc::new(Mutex::new(Inner {
                mode: SimMode::Input,
                driven: Level::Low,
                input: Level::Low,
            }))),
        }
    }

    /// Handle for observing and driving the simulated line.
    pub fn state(&self) -> SimState {
        self.state.clone()
    }
}

impl Default for SimPin {
    fn default() -> Self {
        Self::new()
    }
}

impl PinBackend for SimPin {
    fn make_output(&mut self, level: Level) {
        let mut inner = self.state.lock();
        inner.mode = SimMode::Output;
        inner.driven = level;
    }

    fn make_input(&mut self) {
        self.state.lock().mode = SimMode::Input;
    }

    fn read_level(&mut self) -> Level {
        let inner = self.state.lock();
        match inner.mode {
            SimMode::Input => inner.input,
            SimMode::Output => inner.driven,
        }
    }

    fn write_level(&mut self, level: Level) {
        self.state.lock().driven = level;
    }
}
