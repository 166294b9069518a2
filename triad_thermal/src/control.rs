//! Heater temperature control loop.
//!
//! Runs on its own slow cadence, independent of motion: sample the RC
//! thermistor, low-pass the raw series, run the PID, and drive the heater
//! pin as a slow software PWM (period on the order of a second).
//!
//! Safety overrides:
//! - a sensor that reads open or short for more than two consecutive
//!   samples forces the heater off and latches [`ThermalError::ThermistorFault`];
//! - a nonzero setpoint that fails to raise the temperature by the
//!   configured threshold within the startup window latches
//!   [`ThermalError::HeaterRunaway`].
//!
//! The loop owns the heater and thermistor pins exclusively; it shares no
//! mutable state with the motion producer.

use thiserror::Error;
use tracing::{debug, info, warn};

use triad_common::config::ThermalConfig;
use triad_common::io::{IoPin, Level};

use crate::filter::LowPass;
use crate::pid::{pid_compute, PidGains, PidState};
use crate::rctherm::{FaultKind, RcThermistor, SampleOutcome};

/// Consecutive faulty samples tolerated before latching.
const FAULT_DEBOUNCE: u8 = 2;

/// Thermal supervision failures. Both are latching: the heater stays off
/// until the fault is explicitly cleared.
#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum ThermalError {
    /// Sensor open or short beyond the debounce window.
    #[error("thermistor fault: {kind:?} for more than {FAULT_DEBOUNCE} consecutive samples")]
    ThermistorFault { kind: FaultKind },

    /// Setpoint active but the plant never warmed up.
    #[error("heater runaway: rise of {observed_c:.1} °C in the startup window (needed {required_c:.1} °C)")]
    HeaterRunaway { observed_c: f64, required_c: f64 },
}

/// Armed while waiting for the initial temperature rise.
#[derive(Debug, Clone, Copy)]
struct RunawayWatch {
    baseline_c: Option<f64>,
    deadline_us: u64,
}

/// The closed-loop heater controller.
pub struct TempControl {
    therm: RcThermistor,
    heater: IoPin,
    gains: PidGains,
    pid: PidState,
    lpf: LowPass,
    sample_period_us: u64,
    pwm_period_us: u64,
    runaway_min_rise_c: f64,
    runaway_window_us: u64,
    setpoint_c: f64,
    duty: f64,
    fault_streak: u8,
    latched: Option<ThermalError>,
    runaway: Option<RunawayWatch>,
    next_sample_us: u64,
    last_reading_us: Option<u64>,
}

impl TempControl {
    pub fn new(therm: RcThermistor, mut heater: IoPin, config: &ThermalConfig) -> Self {
        // The heater idles off until a setpoint arrives.
        heater.make_output(Level::Low);
        Self {
            therm,
            heater,
            gains: PidGains::from(&config.pid),
            pid: PidState::default(),
            lpf: LowPass::new(config.lpf_time_const_s),
            sample_period_us: config.sample_period_us,
            pwm_period_us: config.pwm_period_us,
            runaway_min_rise_c: config.runaway_min_rise_c,
            runaway_window_us: (config.runaway_window_s * 1e6) as u64,
            setpoint_c: 0.0,
            duty: 0.0,
            fault_streak: 0,
            latched: None,
            runaway: None,
            next_sample_us: 0,
            last_reading_us: None,
        }
    }

    /// Change the target temperature [°C]. Zero disables the heater.
    ///
    /// A rising setpoint arms the runaway watch: the plant must warm by
    /// the configured threshold within the startup window.
    pub fn set_target(&mut self, setpoint_c: f64, now_us: u64) {
        info!(setpoint_c, "heater setpoint");
        self.pid.reset();
        if setpoint_c > 0.0 && self.setpoint_c == 0.0 {
            self.runaway = Some(RunawayWatch {
                baseline_c: self.lpf.value(),
                deadline_us: now_us + self.runaway_window_us,
            });
        } else if setpoint_c == 0.0 {
            self.runaway = None;
        }
        self.setpoint_c = setpoint_c;
    }

    /// Latest filtered temperature [°C].
    #[inline]
    pub fn current_c(&self) -> Option<f64> {
        self.lpf.value()
    }

    /// Current heater duty cycle [0, 1].
    #[inline]
    pub fn duty(&self) -> f64 {
        self.duty
    }

    /// A latched fault, if any.
    #[inline]
    pub const fn fault(&self) -> Option<ThermalError> {
        self.latched
    }

    /// Clear a latched fault after the operator intervenes.
    pub fn clear_fault(&mut self) {
        self.latched = None;
        self.fault_streak = 0;
        self.pid.reset();
    }

    /// Advance the loop. Call at least once per sampling period; `now_us`
    /// is the monotonic microsecond clock.
    ///
    /// Returns the fault on the tick that latches it; afterwards the loop
    /// keeps running with the heater forced off.
    pub fn tick(&mut self, now_us: u64) -> Result<(), ThermalError> {
        let mut new_fault = None;

        if !self.therm.is_sampling() && now_us >= self.next_sample_us {
            self.therm.begin_sample(now_us);
            self.next_sample_us = now_us + self.sample_period_us;
        }

        if let Some(outcome) = self.therm.poll(now_us) {
            match outcome {
                SampleOutcome::Reading { temperature_c, .. } => {
                    self.fault_streak = 0;
                    let dt = match self.last_reading_us {
                        Some(prev) => (now_us.saturating_sub(prev)) as f64 * 1e-6,
                        None => self.sample_period_us as f64 * 1e-6,
                    };
                    self.last_reading_us = Some(now_us);
                    let filtered = self.lpf.apply(temperature_c, dt);
                    self.update_duty(filtered, dt);
                    if let Some(fault) = self.check_runaway(filtered, now_us) {
                        new_fault = Some(fault);
                    }
                }
                SampleOutcome::Fault(kind) => {
                    self.fault_streak = self.fault_streak.saturating_add(1);
                    warn!(?kind, streak = self.fault_streak, "thermistor sample fault");
                    if self.fault_streak > FAULT_DEBOUNCE {
                        new_fault = Some(ThermalError::ThermistorFault { kind });
                    }
                }
            }
        }

        if let Some(fault) = new_fault {
            self.latch(fault);
        }
        self.drive_heater(now_us);
        match new_fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn update_duty(&mut self, filtered_c: f64, dt: f64) {
        if self.latched.is_some() || self.setpoint_c <= 0.0 {
            self.duty = 0.0;
            return;
        }
        let error = self.setpoint_c - filtered_c;
        self.duty = pid_compute(&mut self.pid, &self.gains, error, dt).clamp(0.0, 1.0);
        debug!(
            filtered_c,
            setpoint_c = self.setpoint_c,
            duty = self.duty,
            "temperature cycle"
        );
    }

    fn check_runaway(&mut self, filtered_c: f64, now_us: u64) -> Option<ThermalError> {
        let watch = self.runaway.as_mut()?;
        let baseline = match watch.baseline_c {
            Some(baseline) => baseline,
            None => {
                // First reading after arming becomes the baseline.
                watch.baseline_c = Some(filtered_c);
                return None;
            }
        };
        let observed = filtered_c - baseline;
        if observed >= self.runaway_min_rise_c {
            self.runaway = None;
            return None;
        }
        if now_us >= watch.deadline_us {
            self.runaway = None;
            return Some(ThermalError::HeaterRunaway {
                observed_c: observed,
                required_c: self.runaway_min_rise_c,
            });
        }
        None
    }

    fn latch(&mut self, fault: ThermalError) {
        warn!(%fault, "thermal fault latched, heater disabled");
        self.latched = Some(fault);
        self.duty = 0.0;
        self.setpoint_c = 0.0;
        self.runaway = None;
    }

    /// Slow PWM: on for the first `duty` fraction of each period.
    fn drive_heater(&mut self, now_us: u64) {
        let on = if self.latched.is_some() || self.duty <= 0.0 {
            false
        } else if self.duty >= 1.0 {
            true
        } else {
            let phase = now_us % self.pwm_period_us;
            (phase as f64) < self.duty * self.pwm_period_us as f64
        };
        self.heater
            .digital_write(if on { Level::High } else { Level::Low });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rctherm::{RcThermistorParams, CHARGE_US};
    use triad_common::config::{PidConfig, ThermalConfig};
    use triad_common::io::sim::{SimPin, SimState};
    use triad_common::io::PinSpec;

    fn thermal_config() -> ThermalConfig {
        ThermalConfig {
            ra_ohm: 665.0,
            c_pico: 2_200_000.0,
            vcc_mv: 3300.0,
            thresh_mv: 1600.0,
            t0_c: 25.0,
            r0_ohm: 100_000.0,
            beta: 3950.0,
            pid: PidConfig {
                kp: 0.018,
                ki: 0.00025,
                kd: 0.001,
                integral_cap: 1.0,
            },
            lpf_time_const_s: 0.0, // unfiltered for deterministic tests
            sample_period_us: 100_000,
            pwm_period_us: 1_500_000,
            runaway_min_rise_c: 5.0,
            runaway_window_s: 120.0,
        }
    }

    struct Harness {
        control: TempControl,
        therm_line: SimState,
        heater_line: SimState,
        now_us: u64,
    }

    impl Harness {
        fn new() -> Self {
            let config = thermal_config();
            let therm_sim = SimPin::new();
            let therm_line = therm_sim.state();
            let heater_sim = SimPin::new();
            let heater_line = heater_sim.state();
            let therm = RcThermistor::new(
                IoPin::new(PinSpec::plain(7), therm_sim),
                RcThermistorParams::from(&config),
            );
            let heater = IoPin::new(
                PinSpec {
                    pin: 10,
                    invert_reads: false,
                    invert_writes: false,
                    default_state: Default::default(),
                },
                heater_sim,
            );
            Self {
                control: TempControl::new(therm, heater, &config),
                therm_line,
                heater_line,
                now_us: 0,
            }
        }

        /// Run one full sample that reads as `r_ohm`, returning the tick
        /// result of the completing poll.
        fn sample(&mut self, r_ohm: f64) -> Result<(), ThermalError> {
            let params = RcThermistorParams::from(&thermal_config());
            let discharge = params.discharge_for_resistance(r_ohm);
            self.control.tick(self.now_us).unwrap(); // begins charge
            self.therm_line.set_input_level(Level::High);
            self.now_us += CHARGE_US;
            self.control.tick(self.now_us).unwrap(); // flips to discharge
            self.now_us += discharge;
            self.therm_line.set_input_level(Level::Low);
            let result = self.control.tick(self.now_us);
            // Leave slack before the next sample begins.
            self.now_us += 100_000;
            result
        }

        /// Run one sample that never discharges (open sensor).
        fn sample_open(&mut self) -> Result<(), ThermalError> {
            let params = RcThermistorParams::from(&thermal_config());
            self.control.tick(self.now_us).unwrap();
            self.therm_line.set_input_level(Level::High);
            self.now_us += CHARGE_US;
            self.control.tick(self.now_us).unwrap();
            self.now_us += params.max_discharge_us() + 1_000;
            let result = self.control.tick(self.now_us);
            self.now_us += 100_000;
            result
        }
    }

    /// Resistance a bit below R0: reads as warmer than 25 °C.
    const WARM_OHM: f64 = 80_000.0;

    #[test]
    fn duty_rises_when_below_setpoint() {
        let mut h = Harness::new();
        h.control.set_target(80.0, h.now_us);
        h.sample(100_000.0).unwrap(); // 25 °C, far below target
        assert!(h.control.duty() > 0.9, "duty={}", h.control.duty());
        assert_eq!(h.heater_line.level(), Level::High);
    }

    #[test]
    fn heater_stays_off_without_setpoint() {
        let mut h = Harness::new();
        h.sample(100_000.0).unwrap();
        assert_eq!(h.control.duty(), 0.0);
        assert_eq!(h.heater_line.level(), Level::Low);
    }

    #[test]
    fn two_faulty_samples_are_tolerated() {
        let mut h = Harness::new();
        h.control.set_target(80.0, h.now_us);
        h.sample(100_000.0).unwrap();
        assert!(h.sample_open().is_ok());
        assert!(h.sample_open().is_ok());
        assert!(h.control.fault().is_none());
    }

    #[test]
    fn third_consecutive_fault_latches_and_kills_heater() {
        let mut h = Harness::new();
        h.control.set_target(80.0, h.now_us);
        h.sample(100_000.0).unwrap();
        assert_eq!(h.heater_line.level(), Level::High);
        h.sample_open().unwrap();
        h.sample_open().unwrap();
        let err = h.sample_open().unwrap_err();
        assert!(matches!(err, ThermalError::ThermistorFault { kind: FaultKind::Open }));
        assert_eq!(h.control.duty(), 0.0);
        assert_eq!(h.heater_line.level(), Level::Low);
        // Latched: later good samples do not re-enable the heater.
        h.sample(WARM_OHM).unwrap();
        assert_eq!(h.control.duty(), 0.0);
        assert!(h.control.fault().is_some());
    }

    #[test]
    fn good_sample_resets_fault_streak() {
        let mut h = Harness::new();
        h.control.set_target(80.0, h.now_us);
        h.sample_open().unwrap();
        h.sample_open().unwrap();
        h.sample(100_000.0).unwrap(); // streak resets
        h.sample_open().unwrap();
        h.sample_open().unwrap();
        assert!(h.control.fault().is_none());
    }

    #[test]
    fn runaway_when_no_rise_within_window() {
        let mut h = Harness::new();
        h.sample(100_000.0).unwrap(); // establish 25 °C baseline
        h.control.set_target(80.0, h.now_us);
        // Hold at 25 °C past the 120 s window: ~1201 samples.
        let mut latched = None;
        for _ in 0..1_300 {
            if let Err(e) = h.sample(100_000.0) {
                latched = Some(e);
                break;
            }
        }
        match latched {
            Some(ThermalError::HeaterRunaway { required_c, .. }) => {
                assert_eq!(required_c, 5.0)
            }
            other => panic!("expected runaway, got {other:?}"),
        }
        assert_eq!(h.control.duty(), 0.0);
    }

    #[test]
    fn rise_disarms_runaway_watch() {
        let mut h = Harness::new();
        h.sample(100_000.0).unwrap();
        h.control.set_target(80.0, h.now_us);
        // Warm past the 5 °C threshold early in the window.
        h.sample(WARM_OHM).unwrap();
        for _ in 0..1_300 {
            h.sample(WARM_OHM).unwrap();
        }
        assert!(h.control.fault().is_none());
    }

    #[test]
    fn clear_fault_reenables_control() {
        let mut h = Harness::new();
        h.control.set_target(80.0, h.now_us);
        h.sample(100_000.0).unwrap();
        h.sample_open().unwrap();
        h.sample_open().unwrap();
        h.sample_open().unwrap_err();
        h.control.clear_fault();
        h.control.set_target(80.0, h.now_us);
        h.sample(100_000.0).unwrap();
        assert!(h.control.duty() > 0.0);
    }
}
