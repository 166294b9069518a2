//! RC-discharge thermistor readout.
//!
//! The sense pin charges the capacitor by driving high, then switches to
//! input and times how long the node takes to decay below the input
//! threshold. The decay `V(t) = Vcc·e^(−t/RC)` gives
//! `R_total = t / (C·ln(Vcc/Vthresh))`; subtracting the series resistor
//! leaves the thermistor, and the β model turns resistance into
//! temperature.
//!
//! Open and short circuits show up as discharge durations outside the
//! plausible resistance band and are debounced over consecutive samples
//! by the control loop.

use tracing::trace;

use triad_common::config::ThermalConfig;
use triad_common::io::{IoPin, Level};

/// Charge time before each discharge measurement [µs]. A few RC time
/// constants of the sense network at the lowest plausible resistance.
pub const CHARGE_US: u64 = 10_000;

/// Thermistor resistance above this reads as an open circuit [Ω].
const OPEN_CIRCUIT_OHM: f64 = 2_000_000.0;

/// Thermistor resistance below this reads as a short [Ω].
const SHORT_CIRCUIT_OHM: f64 = 20.0;

/// Kelvin offset.
const ZERO_C_IN_K: f64 = 273.15;

/// Sensor failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Discharge never crossed the threshold in time.
    Open,
    /// Discharge finished implausibly fast.
    Short,
}

/// Result of one completed discharge measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// A plausible reading.
    Reading {
        /// β-model temperature [°C].
        temperature_c: f64,
        /// Raw discharge duration [µs].
        discharge_us: u64,
    },
    /// The sensor looks open or shorted.
    Fault(FaultKind),
}

/// Electrical and β-model parameters.
#[derive(Debug, Clone, Copy)]
pub struct RcThermistorParams {
    /// Series resistance in the discharge path [Ω].
    pub ra_ohm: f64,
    /// Capacitance [F].
    pub c_farad: f64,
    /// Supply voltage [mV].
    pub vcc_mv: f64,
    /// Input threshold [mV].
    pub thresh_mv: f64,
    /// Reference temperature [°C].
    pub t0_c: f64,
    /// Resistance at the reference temperature [Ω].
    pub r0_ohm: f64,
    /// β coefficient [K].
    pub beta: f64,
}

impl From<&ThermalConfig> for RcThermistorParams {
    fn from(config: &ThermalConfig) -> Self {
        Self {
            ra_ohm: config.ra_ohm,
            c_farad: config.c_pico * 1e-12,
            vcc_mv: config.vcc_mv,
            thresh_mv: config.thresh_mv,
            t0_c: config.t0_c,
            r0_ohm: config.r0_ohm,
            beta: config.beta,
        }
    }
}

impl RcThermistorParams {
    /// `ln(Vcc / Vthresh)` — the decay factor of the threshold crossing.
    #[inline]
    fn ln_factor(&self) -> f64 {
        (self.vcc_mv / self.thresh_mv).ln()
    }

    /// Total RC resistance implied by a discharge duration, minus the
    /// series resistor [Ω].
    pub fn resistance_from_discharge(&self, discharge_us: u64) -> f64 {
        let t_s = discharge_us as f64 * 1e-6;
        let r_total = t_s / (self.c_farad * self.ln_factor());
        (r_total - self.ra_ohm).max(0.0)
    }

    /// Discharge duration a given thermistor resistance would produce
    /// [µs]. Inverse of [`Self::resistance_from_discharge`].
    pub fn discharge_for_resistance(&self, r_ohm: f64) -> u64 {
        let t_s = (r_ohm + self.ra_ohm) * self.c_farad * self.ln_factor();
        (t_s * 1e6).round() as u64
    }

    /// β-model temperature [°C]: `1/T = 1/T0 + ln(R/R0)/β`.
    pub fn temperature_c(&self, r_ohm: f64) -> f64 {
        if r_ohm == self.r0_ohm {
            // ln(1) = 0 exactly, but the double reciprocal would not be.
            return self.t0_c;
        }
        let inv_t = 1.0 / (self.t0_c + ZERO_C_IN_K) + (r_ohm / self.r0_ohm).ln() / self.beta;
        1.0 / inv_t - ZERO_C_IN_K
    }

    /// Longest plausible discharge before the sensor reads open [µs].
    pub fn max_discharge_us(&self) -> u64 {
        self.discharge_for_resistance(OPEN_CIRCUIT_OHM)
    }

    /// Shortest plausible discharge before the sensor reads shorted [µs].
    pub fn min_discharge_us(&self) -> u64 {
        self.discharge_for_resistance(SHORT_CIRCUIT_OHM)
    }
}

// ─── Sampling state machine ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Charging { since_us: u64 },
    Discharging { since_us: u64 },
}

/// One RC thermistor channel: a sense pin plus the sampling state
/// machine. The pin is owned exclusively by the temperature loop.
pub struct RcThermistor {
    pin: IoPin,
    params: RcThermistorParams,
    phase: Phase,
}

impl RcThermistor {
    pub fn new(pin: IoPin, params: RcThermistorParams) -> Self {
        Self {
            pin,
            params,
            phase: Phase::Idle,
        }
    }

    #[inline]
    pub const fn params(&self) -> &RcThermistorParams {
        &self.params
    }

    /// Whether a measurement is in flight.
    pub fn is_sampling(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Begin a measurement: drive the node high to charge the capacitor.
    pub fn begin_sample(&mut self, now_us: u64) {
        self.pin.make_output(Level::High);
        self.phase = Phase::Charging { since_us: now_us };
    }

    /// Advance the measurement. Returns an outcome once the discharge
    /// completes or times out.
    pub fn poll(&mut self, now_us: u64) -> Option<SampleOutcome> {
        match self.phase {
            Phase::Idle => None,
            Phase::Charging { since_us } => {
                if now_us.saturating_sub(since_us) >= CHARGE_US {
                    // Release the node; the capacitor now discharges
                    // through the thermistor network.
                    self.pin.make_input();
                    self.phase = Phase::Discharging { since_us: now_us };
                }
                None
            }
            Phase::Discharging { since_us } => {
                let elapsed = now_us.saturating_sub(since_us);
                if self.pin.digital_read() == Level::Low {
                    self.phase = Phase::Idle;
                    Some(self.classify(elapsed))
                } else if elapsed > self.params.max_discharge_us() {
                    self.phase = Phase::Idle;
                    Some(SampleOutcome::Fault(FaultKind::Open))
                } else {
                    None
                }
            }
        }
    }

    fn classify(&self, discharge_us: u64) -> SampleOutcome {
        if discharge_us < self.params.min_discharge_us() {
            return SampleOutcome::Fault(FaultKind::Short);
        }
        let r = self.params.resistance_from_discharge(discharge_us);
        let temperature_c = self.params.temperature_c(r);
        trace!(discharge_us, r_ohm = r, temperature_c, "thermistor sample");
        SampleOutcome::Reading {
            temperature_c,
            discharge_us,
        }
    }
}
