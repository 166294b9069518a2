//! PID controller with backward Euler integration and a hard integral
//! cap.
//!
//! Zero Ki disables the integral; zero Kd disables the derivative. The
//! cap bounds the integral term's contribution to the output directly,
//! which is the windup protection a slow thermal plant wants: the
//! accumulator can never demand more than `integral_cap` of duty.

use triad_common::config::PidConfig;

/// Internal state of the PID controller.
///
/// Preserves the integral accumulator and previous error across cycles.
/// Reset on setpoint changes so a stale accumulator cannot kick the new
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidState {
    /// Integral term (already scaled by Ki).
    integral: f64,
    /// Previous error (for the derivative).
    prev_error: f64,
    /// Whether prev_error holds a real sample.
    primed: bool,
}

impl PidState {
    /// Reset all internal state to zero.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current integral contribution (for tests and diagnostics).
    #[inline]
    pub const fn integral(&self) -> f64 {
        self.integral
    }
}

/// PID gains.
#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    /// Proportional gain [duty/°C].
    pub kp: f64,
    /// Integral gain [duty/(°C·s)] (0 = disabled).
    pub ki: f64,
    /// Derivative gain [duty·s/°C] (0 = disabled).
    pub kd: f64,
    /// Clamp on |integral term| [duty].
    pub integral_cap: f64,
}

impl From<&PidConfig> for PidGains {
    fn from(config: &PidConfig) -> Self {
        Self {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            integral_cap: config.integral_cap,
        }
    }
}

/// Compute one PID cycle.
///
/// # Arguments
/// - `state`: mutable PID internal state.
/// - `gains`: controller gains.
/// - `error`: setpoint − measured [°C].
/// - `dt`: time since the previous sample [s].
///
/// # Returns
/// Raw controller output [duty]; the caller clamps to its actuator range.
pub fn pid_compute(state: &mut PidState, gains: &PidGains, error: f64, dt: f64) -> f64 {
    if dt <= 0.0 {
        return 0.0;
    }

    let p_term = gains.kp * error;

    let i_term = if gains.ki != 0.0 {
        state.integral += gains.ki * error * dt;
        state.integral = state.integral.clamp(-gains.integral_cap, gains.integral_cap);
        state.integral
    } else {
        state.integral = 0.0;
        0.0
    };

    let d_term = if gains.kd != 0.0 && state.primed {
        gains.kd * (error - state.prev_error) / dt
    } else {
        0.0
    };

    state.prev_error = error;
    state.primed = true;

    p_term + i_term + d_term
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.1; // 10 Hz sampling

    fn gains(kp: f64, ki: f64, kd: f64, cap: f64) -> PidGains {
        PidGains {
            kp,
            ki,
            kd,
            integral_cap: cap,
        }
    }

    #[test]
    fn pure_proportional() {
        let mut s = PidState::default();
        let g = gains(0.018, 0.0, 0.0, 1.0);
        let out = pid_compute(&mut s, &g, 10.0, DT);
        assert!((out - 0.18).abs() < 1e-12);
    }

    #[test]
    fn integral_accumulates_and_caps() {
        let mut s = PidState::default();
        let g = gains(0.0, 0.01, 0.0, 0.5);
        // 100 s of constant 10 °C error: uncapped integral would be 10.
        for _ in 0..1000 {
            pid_compute(&mut s, &g, 10.0, DT);
        }
        assert!((s.integral() - 0.5).abs() < 1e-12);
        let out = pid_compute(&mut s, &g, 10.0, DT);
        assert!((out - 0.5).abs() < 1e-12);
    }

    #[test]
    fn integral_cap_is_symmetric() {
        let mut s = PidState::default();
        let g = gains(0.0, 0.01, 0.0, 0.5);
        for _ in 0..1000 {
            pid_compute(&mut s, &g, -10.0, DT);
        }
        assert!((s.integral() + 0.5).abs() < 1e-12);
    }

    #[test]
    fn derivative_needs_two_samples() {
        let mut s = PidState::default();
        let g = gains(0.0, 0.0, 0.001, 1.0);
        // First sample has no history: no derivative kick.
        let first = pid_compute(&mut s, &g, 5.0, DT);
        assert_eq!(first, 0.0);
        // Error rises by 1 °C over dt: d = Kd·(1/0.1) = 0.01.
        let second = pid_compute(&mut s, &g, 6.0, DT);
        assert!((second - 0.01).abs() < 1e-12);
    }

    #[test]
    fn zero_dt_is_inert() {
        let mut s = PidState::default();
        let g = gains(1.0, 1.0, 1.0, 1.0);
        assert_eq!(pid_compute(&mut s, &g, 5.0, 0.0), 0.0);
        assert_eq!(s.integral(), 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut s = PidState::default();
        let g = gains(0.018, 0.00025, 0.001, 1.0);
        for _ in 0..50 {
            pid_compute(&mut s, &g, 20.0, DT);
        }
        assert!(s.integral() > 0.0);
        s.reset();
        assert_eq!(s.integral(), 0.0);
        let first = pid_compute(&mut s, &g, 1.0, DT);
        // No derivative kick after reset.
        assert!((first - (0.018 + 0.00025 * DT)).abs() < 1e-9);
    }
}
