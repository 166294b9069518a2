//! K-way merge of per-axis step streams.
//!
//! A binary min-heap over the current head of each planner stream, keyed
//! on (time, axis) so simultaneous steps resolve deterministically to the
//! lower axis id. Streams that report completion drop out of the heap;
//! the merge ends when the heap empties. Axes can also be withdrawn
//! mid-stream, which is how homing retires a tower once its endstop
//! asserts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::planner::{AxisPlanner, StepEvent};

/// Heap entry: one pending event plus the planner slot it came from.
struct Pending {
    event: StepEvent,
    slot: usize,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest event
        // (ties to the lower axis id) on top.
        (other.event.time_us, other.event.axis).cmp(&(self.event.time_us, self.event.axis))
    }
}

/// Time-ordered merge of axis planner streams.
pub struct EventMerger {
    planners: Vec<Option<Box<dyn AxisPlanner>>>,
    heap: BinaryHeap<Pending>,
}

impl EventMerger {
    /// Build a merger over a set of planners, priming one event per
    /// stream.
    pub fn new(planners: Vec<Box<dyn AxisPlanner>>) -> Self {
        let mut merger = Self {
            planners: planners.into_iter().map(Some).collect(),
            heap: BinaryHeap::new(),
        };
        for slot in 0..merger.planners.len() {
            merger.refill(slot);
        }
        merger
    }

    /// Withdraw an axis mid-stream. Its already-queued head event is
    /// discarded lazily on the next pop.
    pub fn remove_axis(&mut self, axis: usize) {
        for planner in self.planners.iter_mut() {
            if planner.as_ref().is_some_and(|p| p.axis() == axis) {
                *planner = None;
            }
        }
    }

    /// Whether any stream still has events queued or pending.
    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }

    fn refill(&mut self, slot: usize) {
        if let Some(planner) = self.planners[slot].as_mut() {
            if let Some(event) = planner.next_step() {
                self.heap.push(Pending { event, slot });
            } else {
                self.planners[slot] = None;
            }
        }
    }
}

impl Iterator for EventMerger {
    type Item = StepEvent;

    fn next(&mut self) -> Option<StepEvent> {
        loop {
            let Pending { event, slot } = self.heap.pop()?;
            if self.planners[slot].is_none() {
                // Axis was withdrawn after this event was queued.
                continue;
            }
            self.refill(slot);
            return Some(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::StepDirection;

    /// Scripted planner for merge tests.
    struct Scripted {
        axis: usize,
        times: std::vec::IntoIter<u64>,
    }

    impl Scripted {
        fn new(axis: usize, times: Vec<u64>) -> Box<dyn AxisPlanner> {
            Box::new(Self {
                axis,
                times: times.into_iter(),
            })
        }
    }

    impl AxisPlanner for Scripted {
        fn axis(&self) -> usize {
            self.axis
        }

        fn next_step(&mut self) -> Option<StepEvent> {
            self.times.next().map(|time_us| StepEvent {
                axis: self.axis,
                time_us,
                direction: StepDirection::Positive,
            })
        }
    }

    #[test]
    fn merges_in_time_order() {
        let merger = EventMerger::new(vec![
            Scripted::new(0, vec![10, 30, 50]),
            Scripted::new(1, vec![20, 40, 60]),
        ]);
        let times: Vec<(u64, usize)> = merger.map(|e| (e.time_us, e.axis)).collect();
        assert_eq!(
            times,
            vec![(10, 0), (20, 1), (30, 0), (40, 1), (50, 0), (60, 1)]
        );
    }

    #[test]
    fn ties_break_to_lower_axis() {
        let merger = EventMerger::new(vec![
            Scripted::new(2, vec![5, 10]),
            Scripted::new(0, vec![5, 10]),
            Scripted::new(1, vec![5]),
        ]);
        let order: Vec<(u64, usize)> = merger.map(|e| (e.time_us, e.axis)).collect();
        assert_eq!(order, vec![(5, 0), (5, 1), (5, 2), (10, 0), (10, 2)]);
    }

    #[test]
    fn output_times_are_non_decreasing() {
        let merger = EventMerger::new(vec![
            Scripted::new(0, vec![1, 4, 9, 16, 25]),
            Scripted::new(1, vec![2, 3, 5, 8, 13]),
            Scripted::new(2, vec![6, 7, 20]),
        ]);
        let times: Vec<u64> = merger.map(|e| e.time_us).collect();
        assert_eq!(times.len(), 13);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn empty_streams_terminate_immediately() {
        let mut merger = EventMerger::new(vec![
            Scripted::new(0, vec![]),
            Scripted::new(1, vec![]),
        ]);
        assert!(merger.next().is_none());
        assert!(merger.is_exhausted());
    }

    #[test]
    fn removed_axis_emits_no_further_events() {
        let mut merger = EventMerger::new(vec![
            Scripted::new(0, vec![10, 20, 30]),
            Scripted::new(1, vec![15, 25, 35]),
        ]);
        assert_eq!(merger.next().unwrap().time_us, 10);
        merger.remove_axis(0);
        let rest: Vec<usize> = merger.map(|e| e.axis).collect();
        assert_eq!(rest, vec![1, 1, 1]);
    }
}
