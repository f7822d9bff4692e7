//! Per-priority ready lanes with a presence bitmap.
//!
//! Each priority level holds a FIFO lane; insertion order is arrival order,
//! which is what gives round robin among equals. The bitmap makes the
//! highest-urgency non-empty lane an O(1) lookup independent of task count.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use kite_core::{Priority, PrioritySet, PRIORITY_LEVELS};

use crate::task::TaskId;

pub(crate) struct ReadyQueue {
    lanes: Vec<VecDeque<TaskId>>,
    present: PrioritySet,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        let mut lanes = Vec::with_capacity(PRIORITY_LEVELS as usize);
        lanes.resize_with(PRIORITY_LEVELS as usize, VecDeque::new);
        Self {
            lanes,
            present: PrioritySet::new(),
        }
    }

    /// Appends a task at the tail of its priority lane.
    pub(crate) fn push_tail(&mut self, task: TaskId, prio: Priority) {
        self.lanes[prio.level() as usize].push_back(task);
        self.present.insert(prio);
    }

    /// Removes a task from the given lane. Returns false if absent.
    pub(crate) fn remove(&mut self, task: TaskId, prio: Priority) -> bool {
        let lane = &mut self.lanes[prio.level() as usize];
        let Some(pos) = lane.iter().position(|t| *t == task) else {
            return false;
        };
        lane.remove(pos);
        if lane.is_empty() {
            self.present.remove(prio);
        }
        true
    }

    /// Most urgent non-empty lane.
    pub(crate) fn most_urgent_level(&self) -> Option<Priority> {
        self.present.most_urgent()
    }

    /// Dequeues the head of the most urgent non-empty lane.
    pub(crate) fn pop_most_urgent(&mut self) -> Option<TaskId> {
        let prio = self.present.most_urgent()?;
        let lane = &mut self.lanes[prio.level() as usize];
        let task = lane.pop_front();
        if lane.is_empty() {
            self.present.remove(prio);
        }
        task
    }

    /// True when no task of any priority is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Number of tasks queued at one level.
    pub(crate) fn lane_len(&self, prio: Priority) -> usize {
        self.lanes[prio.level() as usize].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    #[test]
    fn pop_takes_most_urgent_head() {
        let mut q = ReadyQueue::new();
        q.push_tail(TaskId(1), prio(8));
        q.push_tail(TaskId(2), prio(3));
        q.push_tail(TaskId(3), prio(3));

        assert_eq!(q.most_urgent_level(), Some(prio(3)));
        assert_eq!(q.pop_most_urgent(), Some(TaskId(2)));
        assert_eq!(q.pop_most_urgent(), Some(TaskId(3)));
        assert_eq!(q.pop_most_urgent(), Some(TaskId(1)));
        assert_eq!(q.pop_most_urgent(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_priority_preserves_arrival_order() {
        let mut q = ReadyQueue::new();
        for n in 0..4 {
            q.push_tail(TaskId(n), prio(5));
        }
        for n in 0..4 {
            assert_eq!(q.pop_most_urgent(), Some(TaskId(n)));
        }
    }

    #[test]
    fn remove_clears_bitmap_when_lane_drains() {
        let mut q = ReadyQueue::new();
        q.push_tail(TaskId(7), prio(2));
        assert!(q.remove(TaskId(7), prio(2)));
        assert!(!q.remove(TaskId(7), prio(2)));
        assert_eq!(q.most_urgent_level(), None);
        assert_eq!(q.lane_len(prio(2)), 0);
    }
}
