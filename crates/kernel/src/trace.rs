//! Scheduler trace records.
//!
//! An optional hook observes scheduling activity; records are emitted after
//! the kernel-state lock is released. Tests install a recording hook to
//! assert on dispatch order.

use kite_core::TickCount;

use crate::sync::Arc;
use crate::task::TaskId;

/// One observable scheduling event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedRecord {
    /// Context switch from one task to another.
    Switch { from: TaskId, to: TaskId },
    /// Task became ready (created, woken, resumed, or preempted).
    Ready(TaskId),
    /// Task left the ready/running set to block or sleep.
    Sleep(TaskId),
    /// Time base advanced to this absolute tick.
    Tick(TickCount),
    /// Tickless idle entered with this programmed window.
    TicklessEnter(TickCount),
    /// Tickless idle left after this many reconciled ticks.
    TicklessExit(TickCount),
}

/// Observer invoked for every [`SchedRecord`].
pub type TraceHook = Arc<dyn Fn(&SchedRecord) + Send + Sync>;
