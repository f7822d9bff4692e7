//! Inter-task synchronization: shared plumbing.
//!
//! Wait lists, object pools and handles, wake outcomes, and the post-only
//! deferral ring used by interrupt context. The primitives themselves live
//! in [`semaphore`], [`mutex`], [`event`], and [`queue`].

pub mod event;
pub mod mutex;
pub mod queue;
pub mod semaphore;

use alloc::vec::Vec;

use kite_core::{KernelError, KernelResult, Priority};

use crate::task::TaskId;

pub use event::EventMode;

/// Handle to a semaphore in the kernel's object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemId(pub(crate) u16);

/// Handle to a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub(crate) u16);

/// Handle to an event-flag group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) u16);

/// Handle to a message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u16);

/// The synchronization object a blocked task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Semaphore(SemId),
    Mutex(MutexId),
    Event(EventId),
    Queue(QueueId),
}

/// Why a blocked task was made ready again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    /// The pended resource was granted (semaphore taken, mutex owned).
    Acquired,
    /// The awaited event-flag combination, as matched.
    Events(u32),
    /// A message copied out for this receiver.
    Message(Vec<u8>),
    /// The ledger deadline fired before the wake condition.
    Timeout,
    /// The object was destroyed while waited on.
    Deleted,
}

impl WakeReason {
    /// Folds the terminal variants into the error they stand for, so a
    /// resumed task can apply `?` to its wake outcome.
    pub fn into_result(self) -> KernelResult<WakeReason> {
        match self {
            WakeReason::Timeout => Err(KernelError::Timeout),
            WakeReason::Deleted => Err(KernelError::ObjectDeleted),
            other => Ok(other),
        }
    }
}

/// Immediate outcome of a blocking call made by the running task.
///
/// `Blocked` means the caller has been suspended and another task has been
/// dispatched; the final outcome arrives later as a [`WakeReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendStatus {
    Acquired,
    Blocked,
}

/// Wait list ordered by effective priority, ties broken by arrival.
///
/// `T` carries per-waiter payload (event-flag requests); plain primitives
/// use `()`.
pub(crate) struct WaitList<T> {
    entries: Vec<Waiter<T>>,
}

struct Waiter<T> {
    task: TaskId,
    prio: Priority,
    seq: u64,
    want: T,
}

impl<T> WaitList<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts behind every waiter of equal or higher urgency.
    pub(crate) fn insert(&mut self, task: TaskId, prio: Priority, seq: u64, want: T) {
        let pos = self
            .entries
            .iter()
            .position(|w| prio.is_more_urgent_than(w.prio))
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, Waiter {
            task,
            prio,
            seq,
            want,
        });
    }

    /// Dequeues the most urgent waiter.
    pub(crate) fn pop_front(&mut self) -> Option<(TaskId, T)> {
        if self.entries.is_empty() {
            return None;
        }
        let w = self.entries.remove(0);
        Some((w.task, w.want))
    }

    /// Urgency of the head waiter.
    pub(crate) fn head_priority(&self) -> Option<Priority> {
        self.entries.first().map(|w| w.prio)
    }

    /// Payload of one waiter, if present.
    pub(crate) fn want_of(&self, task: TaskId) -> Option<&T> {
        self.entries.iter().find(|w| w.task == task).map(|w| &w.want)
    }

    /// Removes a specific waiter (timeout or deletion path).
    pub(crate) fn remove_task(&mut self, task: TaskId) -> Option<T> {
        let pos = self.entries.iter().position(|w| w.task == task)?;
        Some(self.entries.remove(pos).want)
    }

    /// Re-sorts one waiter after its effective priority changed.
    pub(crate) fn reorder(&mut self, task: TaskId, new_prio: Priority) {
        let Some(pos) = self.entries.iter().position(|w| w.task == task) else {
            return;
        };
        let mut w = self.entries.remove(pos);
        w.prio = new_prio;
        let seq = w.seq;
        // Arrival stamp is kept, so a boosted waiter still queues behind
        // equal-urgency waiters that arrived earlier.
        let pos = self
            .entries
            .iter()
            .position(|other| {
                new_prio.is_more_urgent_than(other.prio)
                    || (new_prio == other.prio && seq < other.seq)
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, w);
    }

    /// Drains every waiter in wake order.
    pub(crate) fn drain_all(&mut self) -> Vec<(TaskId, T)> {
        core::mem::take(&mut self.entries)
            .into_iter()
            .map(|w| (w.task, w.want))
            .collect()
    }

    pub(crate) fn tasks(&self) -> Vec<TaskId> {
        self.entries.iter().map(|w| w.task).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fixed-capacity slot pool for kernel objects.
pub(crate) struct Pool<T> {
    slots: Vec<Option<T>>,
}

impl<T> Pool<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub(crate) fn insert(&mut self, value: T) -> KernelResult<u16> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::ResourceExhausted)?;
        self.slots[slot] = Some(value);
        Ok(slot as u16)
    }

    pub(crate) fn get(&self, id: u16) -> KernelResult<&T> {
        self.slots
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::InvalidState)
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> KernelResult<&mut T> {
        self.slots
            .get_mut(id as usize)
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::InvalidState)
    }

    pub(crate) fn remove(&mut self, id: u16) -> KernelResult<T> {
        self.slots
            .get_mut(id as usize)
            .and_then(|s| s.take())
            .ok_or(KernelError::InvalidState)
    }
}

/// Largest message an ISR-side queue send may carry.
pub const MAX_ISR_MESSAGE: usize = 32;

/// A post recorded in interrupt context, applied at the next scheduler
/// pass. Fixed-capacity payloads only: the ISR path never allocates.
#[derive(Debug, Clone)]
pub(crate) enum DeferredPost {
    Semaphore(SemId),
    Event(EventId, u32),
    Queue(QueueId, heapless::Vec<u8, MAX_ISR_MESSAGE>),
}
