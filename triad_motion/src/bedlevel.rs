//! Bed-level rotation.
//!
//! A 3×3 rotation stored as integer numerators over a fixed 10⁹
//! denominator, so composition with a micrometer vector stays exact in
//! i128. Applied to every incoming Cartesian point before the delta map.

use serde::{Deserialize, Serialize};

use triad_common::units::{div_round, Um};

/// Fixed denominator for matrix entries.
pub const BED_LEVEL_DENOM: i64 = 1_000_000_000;

/// Integer-scaled 3×3 rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BedLevelMatrix {
    rows: [[i64; 3]; 3],
}

impl BedLevelMatrix {
    /// The identity transform (level bed).
    pub const IDENTITY: Self = Self {
        rows: [
            [BED_LEVEL_DENOM, 0, 0],
            [0, BED_LEVEL_DENOM, 0],
            [0, 0, BED_LEVEL_DENOM],
        ],
    };

    /// Build from calibration rows over the 10⁹ denominator.
    pub const fn from_rows(rows: [[i64; 3]; 3]) -> Self {
        Self { rows }
    }

    /// Apply the rotation to a µm vector, rounding each component to the
    /// nearest micrometer.
    pub fn apply(&self, v: [Um; 3]) -> [Um; 3] {
        let mut out = [0i64; 3];
        for (row, dst) in self.rows.iter().zip(out.iter_mut()) {
            let acc: i128 = row
                .iter()
                .zip(v.iter())
                .map(|(m, x)| *m as i128 * *x as i128)
                .sum();
            *dst = div_round(acc, BED_LEVEL_DENOM as i128) as i64;
        }
        out
    }

    /// Apply the inverse rotation (transpose — entries form a rotation).
    pub fn apply_inverse(&self, v: [Um; 3]) -> [Um; 3] {
        let mut out = [0i64; 3];
        for (i, dst) in out.iter_mut().enumerate() {
            let acc: i128 = (0..3)
                .map(|j| self.rows[j][i] as i128 * v[j] as i128)
                .sum();
            *dst = div_round(acc, BED_LEVEL_DENOM as i128) as i64;
        }
        out
    }
}

impl Default for BedLevelMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Calibration rows for a bed tilted roughly [-0.007, 0.0015, 0.99].
    const TILTED: [[i64; 3]; 3] = [
        [999_975_003, 5_356, -7_070_522],
        [5_356, 999_998_852, 1_515_111],
        [7_070_522, -1_515_111, 999_973_855],
    ];

    #[test]
    fn identity_is_exact() {
        let m = BedLevelMatrix::IDENTITY;
        let v = [111_000, -85_000, 467_330];
        assert_eq!(m.apply(v), v);
        assert_eq!(m.apply_inverse(v), v);
    }

    #[test]
    fn rotation_round_trips_within_one_um() {
        let m = BedLevelMatrix::from_rows(TILTED);
        let v = [50_000, -30_000, 10_000];
        let rotated = m.apply(v);
        assert_ne!(rotated, v);
        let back = m.apply_inverse(rotated);
        for (orig, restored) in v.iter().zip(back.iter()) {
            assert!((orig - restored).abs() <= 1, "{v:?} -> {back:?}");
        }
    }

    #[test]
    fn rotation_preserves_length_approximately() {
        let m = BedLevelMatrix::from_rows(TILTED);
        let v = [60_000i64, 0, 0];
        let r = m.apply(v);
        let len2: i128 = r.iter().map(|x| *x as i128 * *x as i128).sum();
        let orig2: i128 = v.iter().map(|x| *x as i128 * *x as i128).sum();
        let diff = (len2 - orig2).abs();
        // Within ~1 µm of length drift on a 60 mm vector.
        assert!(diff <= 2 * 60_000 + 1, "length drift {diff}");
    }
}
