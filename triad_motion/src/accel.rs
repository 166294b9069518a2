//! Constant-acceleration trapezoidal velocity profile.
//!
//! Maps elapsed move time to scalar distance traveled along the path and
//! back. The profile is a symmetric accelerate-cruise-decelerate trapezoid
//! that collapses to a triangle when the peak velocity cannot be reached
//! within the available distance. The inverse `time_at_um` is the hot-path
//! primitive: "at what time does this axis's k-th step occur?"

use triad_common::units::{us_from_secs, Us, US_PER_SEC};

/// A planned velocity profile for one move.
///
/// Internally in seconds and µm; the public API speaks µs.
#[derive(Debug, Clone, Copy)]
pub struct TrapezoidProfile {
    /// Total path length [µm].
    distance_um: f64,
    /// Peak velocity actually reached [µm/s].
    v_peak: f64,
    /// Acceleration magnitude [µm/s²].
    accel: f64,
    /// Duration of the acceleration (= deceleration) phase [s].
    t_accel: f64,
    /// Duration of the cruise phase [s].
    t_cruise: f64,
    /// Total duration [s].
    total: f64,
    /// Distance covered during the acceleration phase [µm].
    d_accel: f64,
}

impl TrapezoidProfile {
    /// Plan a profile over `distance_um` with velocity and acceleration
    /// caps. A zero-length move yields a zero-duration profile.
    pub fn plan(distance_um: f64, v_max_um_s: f64, accel_um_s2: f64) -> Self {
        debug_assert!(distance_um >= 0.0);
        debug_assert!(v_max_um_s > 0.0);
        debug_assert!(accel_um_s2 > 0.0);

        if distance_um <= 0.0 {
            return Self {
                distance_um: 0.0,
                v_peak: 0.0,
                accel: accel_um_s2,
                t_accel: 0.0,
                t_cruise: 0.0,
                total: 0.0,
                d_accel: 0.0,
            };
        }

        // Peak velocity: capped by what a symmetric ramp can reach.
        let v_peak = v_max_um_s.min((accel_um_s2 * distance_um).sqrt());
        let t_accel = v_peak / accel_um_s2;
        let d_accel = 0.5 * accel_um_s2 * t_accel * t_accel;
        let t_cruise = ((distance_um - 2.0 * d_accel) / v_peak).max(0.0);

        Self {
            distance_um,
            v_peak,
            accel: accel_um_s2,
            t_accel,
            t_cruise,
            total: 2.0 * t_accel + t_cruise,
            d_accel,
        }
    }

    /// Total move duration [µs].
    #[inline]
    pub fn duration_us(&self) -> Us {
        us_from_secs(self.total)
    }

    /// Total move duration [µs], unrounded.
    #[inline]
    pub fn duration_us_f64(&self) -> f64 {
        self.total * US_PER_SEC as f64
    }

    /// Peak velocity reached [µm/s].
    #[inline]
    pub fn peak_velocity_um_s(&self) -> f64 {
        self.v_peak
    }

    /// Path length [µm].
    #[inline]
    pub fn distance_um(&self) -> f64 {
        self.distance_um
    }

    /// Scalar distance traveled [µm] at elapsed time `t_us`.
    /// Clamped to the move's time span.
    pub fn distance_at_us(&self, t_us: f64) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        let t = (t_us / US_PER_SEC as f64).clamp(0.0, self.total);
        if t < self.t_accel {
            0.5 * self.accel * t * t
        } else if t < self.t_accel + self.t_cruise {
            self.d_accel + self.v_peak * (t - self.t_accel)
        } else {
            let remaining = self.total - t;
            self.distance_um - 0.5 * self.accel * remaining * remaining
        }
    }

    /// Elapsed time [µs] at which scalar distance `s_um` is reached.
    /// Monotone inverse of [`Self::distance_at_us`]; clamped to the path.
    pub fn time_at_um(&self, s_um: f64) -> f64 {
        if self.distance_um <= 0.0 {
            return 0.0;
        }
        let s = s_um.clamp(0.0, self.distance_um);
        let t = if s < self.d_accel {
            (2.0 * s / self.accel).sqrt()
        } else if s <= self.distance_um - self.d_accel {
            self.t_accel + (s - self.d_accel) / self.v_peak
        } else {
            self.total - (2.0 * (self.distance_um - s) / self.accel).sqrt()
        };
        t * US_PER_SEC as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Kossel-class limits: 100 mm move, 50 mm/s, 1.2 m/s².
    const D: f64 = 100_000.0;
    const V: f64 = 50_000.0;
    const A: f64 = 1_200_000.0;

    #[test]
    fn trapezoid_reaches_peak_and_is_symmetric() {
        let p = TrapezoidProfile::plan(D, V, A);
        assert!((p.peak_velocity_um_s() - V).abs() < 1e-9);
        // Acceleration phase ends at v/a ≈ 41667 µs.
        let t_accel_us = V / A * 1e6;
        assert!((t_accel_us - 41_666.6).abs() < 1.0);
        // Symmetry: half the distance at half the duration.
        let mid = p.duration_us_f64() / 2.0;
        assert!((p.distance_at_us(mid) - D / 2.0).abs() < 1e-6);
    }

    #[test]
    fn triangle_when_peak_unreachable() {
        // 1 mm at 50 mm/s cap: √(a·D) ≈ 34641 µm/s < cap.
        let p = TrapezoidProfile::plan(1_000.0, V, A);
        assert!(p.peak_velocity_um_s() < V);
        assert!((p.peak_velocity_um_s() - (A * 1_000.0f64).sqrt()).abs() < 1e-6);
        // No cruise: duration = 2·v/a.
        let expected_us = 2.0 * p.peak_velocity_um_s() / A * 1e6;
        assert!((p.duration_us_f64() - expected_us).abs() < 1e-6);
    }

    #[test]
    fn endpoints_are_exact() {
        let p = TrapezoidProfile::plan(D, V, A);
        assert_eq!(p.distance_at_us(0.0), 0.0);
        assert!((p.distance_at_us(p.duration_us_f64()) - D).abs() < 1e-9);
        assert_eq!(p.time_at_um(0.0), 0.0);
        assert!((p.time_at_um(D) - p.duration_us_f64()).abs() < 1e-6);
    }

    #[test]
    fn inverse_round_trips() {
        let p = TrapezoidProfile::plan(D, V, A);
        for i in 0..=100 {
            let s = D * i as f64 / 100.0;
            let t = p.time_at_um(s);
            let back = p.distance_at_us(t);
            assert!((back - s).abs() < 1e-6, "s={s} t={t} back={back}");
        }
    }

    #[test]
    fn time_at_is_monotone() {
        let p = TrapezoidProfile::plan(D, V, A);
        let mut prev = -1.0;
        for i in 0..=1000 {
            let s = D * i as f64 / 1000.0;
            let t = p.time_at_um(s);
            assert!(t >= prev, "non-monotone at s={s}");
            prev = t;
        }
    }

    #[test]
    fn velocity_stays_within_cap() {
        let p = TrapezoidProfile::plan(D, V, A);
        let total = p.duration_us_f64();
        let dt = 500.0; // µs
        let mut t = 0.0;
        while t + dt <= total {
            let v = (p.distance_at_us(t + dt) - p.distance_at_us(t)) / (dt / 1e6);
            assert!(v <= V + 1.0, "v={v} at t={t}");
            t += dt;
        }
    }

    #[test]
    fn zero_length_move_is_empty() {
        let p = TrapezoidProfile::plan(0.0, V, A);
        assert_eq!(p.duration_us(), 0);
        assert_eq!(p.distance_at_us(1_000.0), 0.0);
        assert_eq!(p.time_at_um(0.0), 0.0);
    }

    #[test]
    fn duration_exceeds_kinematic_minimum() {
        // duration ≥ D / v_peak (cruise-only lower bound is unreachable
        // with finite acceleration).
        let p = TrapezoidProfile::plan(D, V, A);
        assert!(p.duration_us_f64() > D / V * 1e6);
    }
}
