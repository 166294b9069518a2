//! Integration tests: step streams from planned moves.
//!
//! Exercises the full pipeline — move planning, per-axis planners, and
//! the k-way merger — against the step-stream invariants: strictly
//! increasing per-axis times, exact step counts, and a non-decreasing
//! merged sequence.

use std::collections::HashMap;

use triad_common::config::GeometryConfig;
use triad_motion::{
    BedLevelMatrix, DeltaMap, EventMerger, Move, MoveLimits, Position, StepEvent,
};

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

fn limits() -> MoveLimits {
    MoveLimits {
        max_move_rate_mm_s: 50.0,
        max_ext_rate_mm_s: 60.0,
        max_accel_um_s2: 1_200_000.0,
    }
}

fn collect(start: Position, end: Position, rate: f64) -> (Move, Vec<StepEvent>) {
    let map = map();
    let mv = Move::plan(start, end, rate, &limits());
    let merger = EventMerger::new(mv.planners(&map).unwrap());
    (mv, merger.collect())
}

fn check_invariants(mv: &Move, events: &[StepEvent]) {
    // Merged stream: non-decreasing times, ties broken by axis id.
    for pair in events.windows(2) {
        assert!(pair[0].time_us <= pair[1].time_us, "merged order broken");
        if pair[0].time_us == pair[1].time_us {
            assert!(pair[0].axis < pair[1].axis, "tie-break broken");
        }
    }
    // Per-axis: strictly increasing, inside the move duration.
    let mut last: HashMap<usize, u64> = HashMap::new();
    for event in events {
        if let Some(prev) = last.get(&event.axis) {
            assert!(event.time_us > *prev, "axis {} times not strict", event.axis);
        }
        last.insert(event.axis, event.time_us);
        assert!(event.time_us <= mv.duration_us() + 1);
    }
}

fn steps_per_axis(events: &[StepEvent]) -> [i64; 4] {
    let mut counts = [0i64; 4];
    for event in events {
        counts[event.axis] += 1;
    }
    counts
}

#[test]
fn lateral_move_satisfies_stream_invariants() {
    let start = Position::ORIGIN;
    let end = Position::new(50_000, -20_000, 10_000, 2_000);
    let (mv, events) = collect(start, end, 50.0);
    assert!(!events.is_empty());
    check_invariants(&mv, &events);

    // Exact step counts per axis.
    let map = map();
    let start_car = map.carriages_for(start).unwrap();
    let end_car = map.carriages_for(end).unwrap();
    let counts = steps_per_axis(&events);
    for axis in 0..4 {
        assert_eq!(
            counts[axis],
            (end_car.axis(axis) - start_car.axis(axis)).abs(),
            "axis {axis}"
        );
    }
}

#[test]
fn vertical_move_steps_all_towers_equally() {
    let (mv, events) = collect(Position::ORIGIN, Position::new(0, 0, 30_000, 0), 50.0);
    check_invariants(&mv, &events);
    let counts = steps_per_axis(&events);
    assert_eq!(counts[0], counts[1]);
    assert_eq!(counts[1], counts[2]);
    assert!(counts[0] > 0);
    assert_eq!(counts[3], 0);
}

#[test]
fn zero_length_move_emits_nothing() {
    let (_, events) = collect(Position::ORIGIN, Position::ORIGIN, 50.0);
    assert!(events.is_empty());
}

#[test]
fn y_axis_move_mirrors_b_and_c() {
    // Straight −y travel: towers B and C see symmetric geometry and step
    // the same count; tower A does the bulk of the descent.
    let (mv, events) = collect(Position::ORIGIN, Position::new(0, -40_000, 0, 0), 50.0);
    check_invariants(&mv, &events);
    let counts = steps_per_axis(&events);
    assert_eq!(counts[1], counts[2]);
    assert!(counts[0] > counts[1]);
}

#[test]
fn extrusion_only_move_steps_only_e() {
    let (mv, events) = collect(Position::ORIGIN, Position::new(0, 0, 0, 5_000), 50.0);
    check_invariants(&mv, &events);
    let counts = steps_per_axis(&events);
    assert_eq!(counts[0] + counts[1] + counts[2], 0);
    assert_eq!(counts[3], 400); // 5 mm at 80000 steps/m
}

#[test]
fn trapezoid_profile_matches_reference_values() {
    // 100 mm at 50 mm/s under 1.2 m/s²: the ramp ends at ≈41667 µs and
    // the midpoint of the move sits at half distance.
    let mv = Move::plan(
        Position::ORIGIN,
        Position::new(0, 0, 100_000, 0),
        50.0,
        &limits(),
    );
    let profile = mv.profile();
    let t_ramp_us = profile.peak_velocity_um_s() / 1_200_000.0 * 1e6;
    assert!((t_ramp_us - 41_666.7).abs() < 1.0);
    let halfway = profile.distance_at_us(profile.duration_us_f64() / 2.0);
    assert!((halfway - 50_000.0).abs() < 1e-6);
}

#[test]
fn dense_and_slow_moves_agree_on_counts() {
    // Step counts are a geometry property, not a speed property.
    let start = Position::new(-30_000, 12_000, 4_000, 0);
    let end = Position::new(45_000, -8_000, 22_000, 1_500);
    let (_, fast) = collect(start, end, 50.0);
    let (_, slow) = collect(start, end, 2.0);
    assert_eq!(steps_per_axis(&fast), steps_per_axis(&slow));
}
