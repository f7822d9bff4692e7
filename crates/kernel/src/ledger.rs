//! Delay/timeout ledger: tasks keyed by absolute wake tick.
//!
//! Sorted map from wake tick to the tasks due at that tick. Insert and
//! remove are logarithmic; `pop_due` drains everything that has come due
//! in non-decreasing tick order. Tasks registered for the same tick wake
//! in registration order, the canonical mass-wake tie-break.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use kite_core::TickCount;

use crate::task::TaskId;

#[derive(Default)]
pub(crate) struct DelayLedger {
    entries: BTreeMap<TickCount, Vec<TaskId>>,
}

impl DelayLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a task to wake at the absolute tick `at`.
    pub(crate) fn insert(&mut self, at: TickCount, task: TaskId) {
        self.entries.entry(at).or_default().push(task);
    }

    /// Cancels a registration. Returns false if it was not present.
    pub(crate) fn remove(&mut self, at: TickCount, task: TaskId) -> bool {
        let Some(bucket) = self.entries.get_mut(&at) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|t| *t == task) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.entries.remove(&at);
        }
        true
    }

    /// Drains every entry due at or before `now`, earliest first.
    pub(crate) fn pop_due(&mut self, now: TickCount) -> Vec<(TickCount, TaskId)> {
        let mut due = Vec::new();
        while let Some((&tick, _)) = self.entries.first_key_value() {
            if tick > now {
                break;
            }
            let (tick, bucket) = self.entries.pop_first().expect("checked non-empty");
            due.extend(bucket.into_iter().map(|t| (tick, t)));
        }
        due
    }

    /// Earliest registered wake tick, for tickless planning.
    pub(crate) fn next_wake(&self) -> Option<TickCount> {
        self.entries.first_key_value().map(|(&tick, _)| tick)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
