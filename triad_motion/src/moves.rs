//! Move construction and decomposition into per-axis planners.
//!
//! A [`Move`] couples Cartesian endpoints with a planned velocity profile.
//! Rates are clamped against the machine limits at construction, so a
//! `Move` that exists is a move the machine may execute; the profile-derived
//! duration is by construction at least the kinematic minimum.

use triad_common::config::MotionConfig;
use triad_common::consts::{AXIS_E, NUM_TOWERS};
use triad_common::units::{Us, UM_PER_MM};

use crate::accel::TrapezoidProfile;
use crate::deltamap::{DeltaMap, GeometryError, Position};
use crate::planner::{AxisPlanner, DeltaTowerPlanner, ExtruderPlanner, TowerPath};

/// Machine motion limits relevant to move planning.
#[derive(Debug, Clone, Copy)]
pub struct MoveLimits {
    /// Coordinated move rate cap [mm/s].
    pub max_move_rate_mm_s: f64,
    /// Extrude/retract rate cap [mm/s].
    pub max_ext_rate_mm_s: f64,
    /// Path acceleration [µm/s²].
    pub max_accel_um_s2: f64,
}

impl From<&MotionConfig> for MoveLimits {
    fn from(config: &MotionConfig) -> Self {
        Self {
            max_move_rate_mm_s: config.max_move_rate_mm_s,
            max_ext_rate_mm_s: config.max_ext_rate_mm_s,
            max_accel_um_s2: config.max_accel_um_s2,
        }
    }
}

/// One planned straight-line move through Cartesian + extrusion space.
#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub start: Position,
    pub end: Position,
    profile: TrapezoidProfile,
}

impl Move {
    /// Plan a move at the requested feed rate, clamped to machine limits.
    ///
    /// The profile is planned over the Cartesian path length; for a pure
    /// extrusion move it is planned over the filament travel instead. When
    /// both move, the rate is additionally capped so the implied filament
    /// speed stays within the extruder limit.
    pub fn plan(
        start: Position,
        end: Position,
        requested_rate_mm_s: f64,
        limits: &MoveLimits,
    ) -> Self {
        debug_assert!(requested_rate_mm_s > 0.0);

        let dx = (end.x - start.x) as f64;
        let dy = (end.y - start.y) as f64;
        let dz = (end.z - start.z) as f64;
        let cartesian_um = (dx * dx + dy * dy + dz * dz).sqrt();
        let extrusion_um = (end.e - start.e).abs() as f64;

        let mm = UM_PER_MM as f64;
        let (path_um, rate_um_s) = if cartesian_um > 0.0 {
            let mut rate = requested_rate_mm_s.min(limits.max_move_rate_mm_s) * mm;
            if extrusion_um > 0.0 {
                // Filament speed is rate·(ext/cart); keep it legal.
                let ext_cap = limits.max_ext_rate_mm_s * mm * cartesian_um / extrusion_um;
                rate = rate.min(ext_cap);
            }
            (cartesian_um, rate)
        } else {
            let rate = requested_rate_mm_s.min(limits.max_ext_rate_mm_s) * mm;
            (extrusion_um, rate)
        };

        Self {
            start,
            end,
            profile: TrapezoidProfile::plan(path_um, rate_um_s, limits.max_accel_um_s2),
        }
    }

    /// Total duration [µs].
    #[inline]
    pub fn duration_us(&self) -> Us {
        self.profile.duration_us()
    }

    /// Peak path velocity [µm/s].
    #[inline]
    pub fn peak_velocity_um_s(&self) -> f64 {
        self.profile.peak_velocity_um_s()
    }

    /// The planned velocity profile.
    #[inline]
    pub fn profile(&self) -> &TrapezoidProfile {
        &self.profile
    }

    /// Resolve the move against the coordinate map into one planner per
    /// axis (three towers + extruder).
    ///
    /// Fails with [`GeometryError::OutOfBounds`] if either endpoint is
    /// unreachable; nothing is scheduled in that case.
    pub fn planners(&self, map: &DeltaMap) -> Result<Vec<Box<dyn AxisPlanner>>, GeometryError> {
        let start_car = map.carriages_for(self.start)?;
        let end_car = map.carriages_for(self.end)?;
        let start_leveled = map.level_point(self.start);
        let end_leveled = map.level_point(self.end);

        let mut planners: Vec<Box<dyn AxisPlanner>> = Vec::with_capacity(NUM_TOWERS + 1);
        for tower in 0..NUM_TOWERS {
            let (tower_x, tower_y) = map.tower_xy(tower);
            let path = TowerPath {
                tower_x,
                tower_y,
                l_um: map.rod_length_um(),
                steps_per_m: map.steps_per_m(),
            };
            planners.push(Box::new(DeltaTowerPlanner::new(
                tower,
                path,
                start_leveled,
                end_leveled,
                start_car.axis(tower),
                end_car.axis(tower),
                self.profile,
            )));
        }
        planners.push(Box::new(ExtruderPlanner::new(
            AXIS_E,
            map.steps_per_m_ext(),
            self.start.e,
            self.end.e,
            start_car.e,
            end_car.e,
            self.profile,
        )));
        Ok(planners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bedlevel::BedLevelMatrix;
    use triad_common::config::GeometryConfig;

    fn limits() -> MoveLimits {
        MoveLimits {
            max_move_rate_mm_s: 50.0,
            max_ext_rate_mm_s: 60.0,
            max_accel_um_s2: 1_200_000.0,
        }
    }

    fn map() -> DeltaMap {
        let geometry = GeometryConfig {
            r_um: 111_000,
            l_um: 221_000,
            h_um: 467_330,
            build_rad_um: 85_000,
            steps_per_m: 25_060,
            steps_per_m_ext: 80_000,
        };
        DeltaMap::new(&geometry, BedLevelMatrix::IDENTITY)
    }

    #[test]
    fn requested_rate_is_clamped() {
        let m = Move::plan(
            Position::ORIGIN,
            Position::new(100_000, 0, 0, 0),
            500.0,
            &limits(),
        );
        assert!((m.peak_velocity_um_s() - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn extrusion_only_move_uses_extruder_cap() {
        let m = Move::plan(
            Position::ORIGIN,
            Position::new(0, 0, 0, 5_000_000),
            500.0,
            &limits(),
        );
        assert!((m.peak_velocity_um_s() - 60_000.0).abs() < 1e-9);
        assert!(m.duration_us() > 0);
    }

    #[test]
    fn mixed_move_respects_filament_speed() {
        // 10 mm travel with 40 mm extrusion: at 50 mm/s path speed the
        // filament would do 200 mm/s, so the path rate must drop to 15.
        let m = Move::plan(
            Position::ORIGIN,
            Position::new(10_000, 0, 0, 40_000),
            50.0,
            &limits(),
        );
        assert!((m.peak_velocity_um_s() - 15_000.0).abs() < 1e-9);
    }

    #[test]
    fn zero_length_move_produces_no_events() {
        let m = Move::plan(Position::ORIGIN, Position::ORIGIN, 50.0, &limits());
        assert_eq!(m.duration_us(), 0);
        let planners = m.planners(&map()).unwrap();
        for mut planner in planners {
            assert!(planner.next_step().is_none());
        }
    }

    #[test]
    fn step_counts_match_carriage_deltas_exactly() {
        let map = map();
        let m = Move::plan(
            Position::ORIGIN,
            Position::new(50_000, -20_000, 10_000, 2_000),
            50.0,
            &limits(),
        );
        let start_car = map.carriages_for(m.start).unwrap();
        let end_car = map.carriages_for(m.end).unwrap();
        for mut planner in m.planners(&map).unwrap() {
            let axis = planner.axis();
            let mut count = 0i64;
            while planner.next_step().is_some() {
                count += 1;
            }
            let expected = (end_car.axis(axis) - start_car.axis(axis)).abs();
            assert_eq!(count, expected, "axis {axis}");
        }
    }

    #[test]
    fn out_of_bounds_endpoint_rejected_before_scheduling() {
        let m = Move::plan(
            Position::ORIGIN,
            Position::new(120_000, 0, 0, 0),
            50.0,
            &limits(),
        );
        assert!(m.planners(&map()).is_err());
    }
}
