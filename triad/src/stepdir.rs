//! Step/direction driver lowering.
//!
//! An A4988-class driver advances one microstep per rising edge on STEP,
//! in the direction latched from DIR. Lowering a step event produces up
//! to three GPIO events: a DIR transition when the direction changes, the
//! STEP rising edge at the scheduled instant, and the falling edge one
//! pulse width later.

use triad_common::config::StepDirPins;
use triad_common::consts::PULSE_WIDTH_US;
use triad_motion::{StepDirection, StepEvent};
use triad_rpio::GpioEvent;

/// Pin masks and direction policy for one stepper driver.
#[derive(Debug)]
pub struct StepDirDriver {
    axis: usize,
    step_mask: u32,
    dir_mask: u32,
    invert_dir: bool,
    /// Extra inversion applied during homing for towers whose homing
    /// travel sign is configured negative.
    flip: bool,
    last_dir: Option<StepDirection>,
}

impl StepDirDriver {
    pub fn new(axis: usize, pins: &StepDirPins) -> Self {
        Self {
            axis,
            step_mask: 1 << pins.step,
            dir_mask: 1 << pins.dir,
            invert_dir: pins.invert_dir,
            flip: false,
            last_dir: None,
        }
    }

    #[inline]
    pub const fn axis(&self) -> usize {
        self.axis
    }

    /// Toggle the homing-direction flip. Also forgets the latched DIR
    /// level so the next step re-emits it.
    pub fn set_flip(&mut self, flip: bool) {
        self.flip = flip;
        self.last_dir = None;
    }

    /// DIR line level for a travel direction.
    fn dir_level_high(&self, direction: StepDirection) -> bool {
        let positive = direction == StepDirection::Positive;
        positive ^ self.invert_dir ^ self.flip
    }

    /// Lower one step event into GPIO events at `base_us` + event time.
    pub fn lower(&mut self, event: &StepEvent, base_us: u64, out: &mut Vec<GpioEvent>) {
        debug_assert_eq!(event.axis, self.axis);
        let t = base_us + event.time_us;

        if self.last_dir != Some(event.direction) {
            self.last_dir = Some(event.direction);
            let (set_mask, clear_mask) = if self.dir_level_high(event.direction) {
                (self.dir_mask, 0)
            } else {
                (0, self.dir_mask)
            };
            // DIR lands in the tick before the step edge reaches the
            // driver, satisfying its setup time.
            out.push(GpioEvent {
                time_us: t,
                set_mask,
                clear_mask,
            });
        }

        out.push(GpioEvent {
            time_us: t,
            set_mask: self.step_mask,
            clear_mask: 0,
        });
        out.push(GpioEvent {
            time_us: t + PULSE_WIDTH_US,
            set_mask: 0,
            clear_mask: self.step_mask,
        });
    }
}
