//! Homing monitor.
//!
//! During homing the machine drives all three carriages toward their
//! endstops and consumes the merged step stream one event at a time,
//! polling the endstop inputs between events. On the first assertion for
//! a tower the monitor latches that tower's carriage position and the
//! caller withdraws its stream from the merger; homing completes when all
//! three towers have latched.
//!
//! There is no interrupt path — the polling cadence during homing must be
//! at least once per [`triad_common::consts::ENDSTOP_POLL_US`].

use thiserror::Error;
use tracing::{info, warn};

use triad_common::consts::NUM_TOWERS;
use triad_common::io::{IoPin, Level};

use crate::planner::StepEvent;

/// Endstop assertion outside homing is an abort condition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MotionError {
    #[error("endstop asserted on axis {axis} outside homing")]
    UnexpectedEndstop { axis: usize },
}

/// A pollable endstop input. Logical `true` = switch struck.
pub trait EndstopInput: Send {
    fn triggered(&mut self) -> bool;
}

/// Endstop backed by a logical pin: struck when the pin reads high.
/// NC/NO wiring is handled by the pin's read-inversion flag.
impl EndstopInput for IoPin {
    fn triggered(&mut self) -> bool {
        self.digital_read() == Level::High
    }
}

/// Verify no endstop is asserted while the machine is not homing.
pub fn check_endstops_clear(
    endstops: &mut [&mut dyn EndstopInput; NUM_TOWERS],
) -> Result<(), MotionError> {
    for (axis, endstop) in endstops.iter_mut().enumerate() {
        if endstop.triggered() {
            return Err(MotionError::UnexpectedEndstop { axis });
        }
    }
    Ok(())
}

/// Per-homing-run monitor state.
pub struct HomingMonitor<'a> {
    endstops: [&'a mut dyn EndstopInput; NUM_TOWERS],
    /// Running carriage position per tower [steps], updated per event.
    carriage: [i64; NUM_TOWERS],
    /// Latched carriage position at assertion, per tower.
    homed: [Option<i64>; NUM_TOWERS],
}

impl<'a> HomingMonitor<'a> {
    pub fn new(
        endstops: [&'a mut dyn EndstopInput; NUM_TOWERS],
        start_carriages: [i64; NUM_TOWERS],
    ) -> Self {
        Self {
            endstops,
            carriage: start_carriages,
            homed: [None; NUM_TOWERS],
        }
    }

    /// Account a scheduled step for a tower that is still seeking.
    pub fn observe(&mut self, event: &StepEvent) {
        if event.axis < NUM_TOWERS && self.homed[event.axis].is_none() {
            self.carriage[event.axis] += event.direction.step_delta();
        }
    }

    /// Poll all unlatched endstops; returns the towers that newly
    /// asserted. The caller withdraws those streams from its merger.
    pub fn poll(&mut self) -> Vec<usize> {
        let mut asserted = Vec::new();
        for tower in 0..NUM_TOWERS {
            if self.homed[tower].is_none() && self.endstops[tower].triggered() {
                info!(tower, carriage = self.carriage[tower], "endstop asserted");
                self.homed[tower] = Some(self.carriage[tower]);
                asserted.push(tower);
            }
        }
        asserted
    }

    /// All three towers have latched.
    pub fn is_complete(&self) -> bool {
        self.homed.iter().all(Option::is_some)
    }

    /// Latched carriage positions once complete.
    pub fn homed_carriages(&self) -> Option<[i64; NUM_TOWERS]> {
        if !self.is_complete() {
            return None;
        }
        Some(self.homed.map(|h| h.unwrap_or_default()))
    }

    /// The homing move ran out of travel before every endstop asserted.
    pub fn report_exhausted(&self) {
        for tower in 0..NUM_TOWERS {
            if self.homed[tower].is_none() {
                warn!(tower, "homing travel exhausted without endstop assertion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{StepDirection, StepEvent};

    /// Endstop that asserts after a fixed number of polls.
    struct AfterPolls {
        remaining: usize,
    }

    impl EndstopInput for AfterPolls {
        fn triggered(&mut self) -> bool {
            if self.remaining == 0 {
                true
            } else {
                self.remaining -= 1;
                false
            }
        }
    }

    fn step(axis: usize, time_us: u64) -> StepEvent {
        StepEvent {
            axis,
            time_us,
            direction: StepDirection::Positive,
        }
    }

    #[test]
    fn latches_carriage_at_assertion() {
        let mut a = AfterPolls { remaining: 2 };
        let mut b = AfterPolls { remaining: 4 };
        let mut c = AfterPolls { remaining: 0 };
        let mut monitor = HomingMonitor::new([&mut a, &mut b, &mut c], [100, 100, 100]);

        // C asserts on the very first poll, before any step.
        assert_eq!(monitor.poll(), vec![2]);
        assert!(!monitor.is_complete());

        for round in 0..5 {
            monitor.observe(&step(0, round * 10));
            monitor.observe(&step(1, round * 10 + 1));
            monitor.observe(&step(2, round * 10 + 2)); // ignored: C latched
            monitor.poll();
        }
        assert!(monitor.is_complete());
        let homed = monitor.homed_carriages().unwrap();
        assert_eq!(homed[2], 100); // latched before any step counted
        assert_eq!(homed[0], 102); // two steps before its 3rd poll asserted
        assert_eq!(homed[1], 104);
    }

    #[test]
    fn incomplete_monitor_reports_no_positions() {
        let mut a = AfterPolls { remaining: usize::MAX };
        let mut b = AfterPolls { remaining: 0 };
        let mut c = AfterPolls { remaining: 0 };
        let mut monitor = HomingMonitor::new([&mut a, &mut b, &mut c], [0; 3]);
        monitor.poll();
        assert!(!monitor.is_complete());
        assert!(monitor.homed_carriages().is_none());
    }

    #[test]
    fn clear_check_flags_stuck_endstop() {
        let mut a = AfterPolls { remaining: usize::MAX };
        let mut b = AfterPolls { remaining: 0 };
        let mut c = AfterPolls { remaining: usize::MAX };
        let err = check_endstops_clear(&mut [&mut a, &mut b, &mut c]).unwrap_err();
        assert_eq!(err, MotionError::UnexpectedEndstop { axis: 1 });
    }

    #[test]
    fn clear_check_passes_when_idle() {
        let mut a = AfterPolls { remaining: usize::MAX };
        let mut b = AfterPolls { remaining: usize::MAX };
        let mut c = AfterPolls { remaining: usize::MAX };
        assert!(check_endstops_clear(&mut [&mut a, &mut b, &mut c]).is_ok());
    }
}
