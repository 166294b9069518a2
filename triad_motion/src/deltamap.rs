//! Linear-delta coordinate map.
//!
//! Converts Cartesian effector positions (plus extrusion) into per-tower
//! carriage heights and back. The forward map is the hot path and stays in
//! integer micrometers with i128 radicands; the inverse solves the
//! three-sphere intersection in f64 and is used only for position
//! reporting.
//!
//! Towers sit at 90°, 210° and 330° around the bed center at radius R. The
//! carriage height above a target (x, y, z) is
//! `z + √(L² − (x − Rcosθ)² − (y − Rsinθ)²)`.

use thiserror::Error;

use triad_common::config::GeometryConfig;
use triad_common::consts::NUM_TOWERS;
use triad_common::units::{div_round, isqrt, steps_from_um, um_from_steps, Um};

use crate::bedlevel::BedLevelMatrix;

// ─── Data model ─────────────────────────────────────────────────────

/// Cartesian effector position plus extrusion, in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub x: Um,
    pub y: Um,
    pub z: Um,
    pub e: Um,
}

impl Position {
    pub const ORIGIN: Self = Self { x: 0, y: 0, z: 0, e: 0 };

    pub const fn new(x: Um, y: Um, z: Um, e: Um) -> Self {
        Self { x, y, z, e }
    }
}

/// Per-axis carriage position in whole motor steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CarriagePosition {
    pub a: i64,
    pub b: i64,
    pub c: i64,
    pub e: i64,
}

impl CarriagePosition {
    /// Step count for a given axis index (A, B, C, E).
    #[inline]
    pub fn axis(&self, axis: usize) -> i64 {
        match axis {
            0 => self.a,
            1 => self.b,
            2 => self.c,
            _ => self.e,
        }
    }

    /// The three tower step counts.
    #[inline]
    pub fn towers(&self) -> [i64; 3] {
        [self.a, self.b, self.c]
    }
}

/// Geometry failure: the requested point cannot be reached.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("point ({x}, {y}, {z}) µm is outside the reachable build volume")]
    OutOfBounds { x: Um, y: Um, z: Um },
}

// ─── DeltaMap ───────────────────────────────────────────────────────

/// The bijection between Cartesian positions and carriage heights for one
/// machine, bed-level rotation included.
#[derive(Debug, Clone)]
pub struct DeltaMap {
    l_um: i64,
    h_um: i64,
    build_rad_um: i64,
    steps_per_m: u32,
    steps_per_m_ext: u32,
    bed_level: BedLevelMatrix,
    tower_x: [i64; NUM_TOWERS],
    tower_y: [i64; NUM_TOWERS],
}

impl DeltaMap {
    pub fn new(geometry: &GeometryConfig, bed_level: BedLevelMatrix) -> Self {
        let r = geometry.r_um;
        // cos/sin of 90°, 210°, 330° — the off-axis towers sit at
        // (±R√3/2, −R/2). √3·R is computed by integer sqrt of 3R².
        let rx = div_round(isqrt((3 * r as i128 * r as i128) as u128) as i128, 2) as i64;
        let half_r = div_round(r as i128, 2) as i64;
        Self {
            l_um: geometry.l_um,
            h_um: geometry.h_um,
            build_rad_um: geometry.build_rad_um,
            steps_per_m: geometry.steps_per_m,
            steps_per_m_ext: geometry.steps_per_m_ext,
            bed_level,
            tower_x: [0, -rx, rx],
            tower_y: [r, -half_r, -half_r],
        }
    }

    /// Rod length [µm].
    #[inline]
    pub const fn rod_length_um(&self) -> i64 {
        self.l_um
    }

    /// Tower steps per meter.
    #[inline]
    pub const fn steps_per_m(&self) -> u32 {
        self.steps_per_m
    }

    /// Extruder steps per meter.
    #[inline]
    pub const fn steps_per_m_ext(&self) -> u32 {
        self.steps_per_m_ext
    }

    /// Tower base coordinates [µm].
    #[inline]
    pub fn tower_xy(&self, tower: usize) -> (i64, i64) {
        (self.tower_x[tower], self.tower_y[tower])
    }

    /// Apply the bed-level rotation to a position's Cartesian part.
    #[inline]
    pub fn level_point(&self, pos: Position) -> [Um; 3] {
        self.bed_level.apply([pos.x, pos.y, pos.z])
    }

    /// Carriage height [µm] for one tower above a bed-leveled point.
    pub fn carriage_height_um(
        &self,
        tower: usize,
        x: Um,
        y: Um,
        z: Um,
    ) -> Result<Um, GeometryError> {
        let dx = (x - self.tower_x[tower]) as i128;
        let dy = (y - self.tower_y[tower]) as i128;
        let radicand = self.l_um as i128 * self.l_um as i128 - dx * dx - dy * dy;
        if radicand < 0 {
            return Err(GeometryError::OutOfBounds { x, y, z });
        }
        Ok(z + isqrt(radicand as u128) as i64)
    }

    /// Forward map: Cartesian + extrusion → carriage steps.
    pub fn carriages_for(&self, pos: Position) -> Result<CarriagePosition, GeometryError> {
        let [x, y, z] = self.level_point(pos);
        let radius2 = x as i128 * x as i128 + y as i128 * y as i128;
        let build2 = self.build_rad_um as i128 * self.build_rad_um as i128;
        if radius2 > build2 {
            return Err(GeometryError::OutOfBounds { x: pos.x, y: pos.y, z: pos.z });
        }
        let mut towers = [0i64; NUM_TOWERS];
        for (i, t) in towers.iter_mut().enumerate() {
            let height = self.carriage_height_um(i, x, y, z)?;
            *t = steps_from_um(height, self.steps_per_m);
        }
        Ok(CarriagePosition {
            a: towers[0],
            b: towers[1],
            c: towers[2],
            e: steps_from_um(pos.e, self.steps_per_m_ext),
        })
    }

    /// Inverse map: carriage steps → Cartesian + extrusion.
    ///
    /// Solves the intersection of three spheres of radius L centered on
    /// the carriages. Reporting path only — f64 is fine here; the result
    /// round-trips through the forward map within ±1 µm.
    pub fn cartesian_for(&self, car: &CarriagePosition) -> Position {
        let l = self.l_um as f64;
        let centers: Vec<[f64; 3]> = (0..NUM_TOWERS)
            .map(|i| {
                [
                    self.tower_x[i] as f64,
                    self.tower_y[i] as f64,
                    um_from_steps(car.towers()[i], self.steps_per_m) as f64,
                ]
            })
            .collect();

        let sub = |a: &[f64; 3], b: &[f64; 3]| [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
        let dot = |a: &[f64; 3], b: &[f64; 3]| a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
        let scale = |a: &[f64; 3], k: f64| [a[0] * k, a[1] * k, a[2] * k];
        let cross = |a: &[f64; 3], b: &[f64; 3]| {
            [
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
            ]
        };

        // Trilateration frame: ex along center 0 → 1, ey in the 0-2 plane.
        let d01 = sub(&centers[1], &centers[0]);
        let d = dot(&d01, &d01).sqrt();
        let ex = scale(&d01, 1.0 / d);
        let d02 = sub(&centers[2], &centers[0]);
        let i = dot(&ex, &d02);
        let ey_raw = sub(&d02, &scale(&ex, i));
        let j = dot(&ey_raw, &ey_raw).sqrt();
        let ey = scale(&ey_raw, 1.0 / j);
        let ez = cross(&ex, &ey);

        // Equal radii collapse the classic solution.
        let px = d / 2.0;
        let py = (i * i + j * j) / (2.0 * j) - (i / j) * px;
        let pz2 = l * l - px * px - py * py;
        let pz = pz2.max(0.0).sqrt();

        // Two intersections; the effector hangs below the carriages.
        let mut best = [f64::MAX; 3];
        for sign in [-1.0, 1.0] {
            let candidate = [
                centers[0][0] + px * ex[0] + py * ey[0] + sign * pz * ez[0],
                centers[0][1] + px * ex[1] + py * ey[1] + sign * pz * ez[1],
                centers[0][2] + px * ex[2] + py * ey[2] + sign * pz * ez[2],
            ];
            if candidate[2] < best[2] {
                best = candidate;
            }
        }

        let leveled = [
            best[0].round() as i64,
            best[1].round() as i64,
            best[2].round() as i64,
        ];
        let [x, y, z] = self.bed_level.apply_inverse(leveled);
        Position {
            x,
            y,
            z,
            e: um_from_steps(car.e, self.steps_per_m_ext),
        }
    }

    /// Carriage position with all towers at the homed height H.
    pub fn homed_carriages(&self) -> CarriagePosition {
        let steps = steps_from_um(self.h_um, self.steps_per_m);
        CarriagePosition { a: steps, b: steps, c: steps, e: 0 }
    }
}
