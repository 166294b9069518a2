//! # Triad Motion Library
//!
//! Geometry and step planning for a linear-delta machine: the bed-level
//! rotation, the Cartesian ↔ carriage coordinate map, the trapezoidal
//! acceleration profile, per-axis step planners, the time-ordered event
//! merger and the homing monitor.
//!
//! The pipeline: a [`moves::Move`] is resolved against the
//! [`deltamap::DeltaMap`] into per-axis [`planner::AxisPlanner`] streams,
//! which [`merge::EventMerger`] interleaves into one monotone
//! [`planner::StepEvent`] sequence for the pulse emitter.

pub mod accel;
pub mod bedlevel;
pub mod deltamap;
pub mod homing;
pub mod merge;
pub mod moves;
pub mod planner;

pub use accel::TrapezoidProfile;
pub use bedlevel::BedLevelMatrix;
pub use deltamap::{CarriagePosition, DeltaMap, GeometryError, Position};
pub use homing::{EndstopInput, HomingMonitor, MotionError};
pub use merge::EventMerger;
pub use moves::{Move, MoveLimits};
pub use planner::{AxisPlanner, StepDirection, StepEvent};
