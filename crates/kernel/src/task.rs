//! Task control records and the fixed-capacity task registry.
//!
//! Tasks are referred to by [`TaskId`], a stable index into the registry
//! arena. Pointer-chained task lists are avoided on purpose: an index
//! handle cannot dangle when a slot is reclaimed, it only turns stale and
//! is rejected with `InvalidState`.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use kite_core::{KernelError, KernelResult, Priority, TickCount};

use crate::ipc::{MutexId, WaitObject, WakeReason};

/// Stable handle for a task: an index into the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u16);

impl TaskId {
    /// Raw slot index, for diagnostics.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered but not yet made eligible to run.
    Created,
    /// Eligible; queued at its effective priority.
    Ready,
    /// The one task currently dispatched.
    Running,
    /// Waiting on a synchronization object.
    Blocked,
    /// Sleeping until a ledger wake tick.
    Delayed,
    /// Taken out of scheduling until explicitly resumed.
    Suspended,
    /// Deleted; the slot is about to be reclaimed.
    Terminated,
}

/// Number of words painted at the overflow end of every stack.
pub(crate) const GUARD_WORDS: usize = 4;

/// Paint value for unused stack words; doubles as the unwind sentinel.
pub(crate) const STACK_PAINT: usize = 0xA5A5_A5A5;

/// Smallest stack a task may be created with, in words: the initial
/// context frame plus the guard words it must never touch.
pub const MIN_STACK_WORDS: usize = SavedContext::WORDS + GUARD_WORDS;

/// A task's owned stack region.
///
/// Stacks grow downward: word 0 is the overflow end, `len - 1` the base.
/// The low `GUARD_WORDS` words stay painted; a repaint failure at context
/// switch is a stack overflow.
#[derive(Debug)]
pub struct StackRegion {
    words: Vec<usize>,
}

impl StackRegion {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![STACK_PAINT; len],
        }
    }

    /// Stack size in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// True while the guard words at the overflow end are still painted.
    pub(crate) fn guard_intact(&self) -> bool {
        self.words[..GUARD_WORDS].iter().all(|w| *w == STACK_PAINT)
    }

    /// Raw stack words, low (overflow end) to high (base).
    pub(crate) fn words(&self) -> &[usize] {
        &self.words
    }

    #[cfg(test)]
    pub(crate) fn words_mut(&mut self) -> &mut [usize] {
        &mut self.words
    }
}

/// Saved execution context: an opaque machine-word blob owned exclusively
/// by the task record. Only the stack pointer is interpreted by the core,
/// for bounds checking; the rest belongs to the port's switch code.
#[derive(Debug)]
pub struct SavedContext {
    /// Word offset of the saved stack pointer within the stack region.
    pub(crate) sp: usize,
    #[allow(dead_code)]
    words: [usize; Self::WORDS],
}

impl SavedContext {
    const WORDS: usize = 16;

    fn initial(stack_len: usize) -> Self {
        Self {
            // Leave room for the initial exception frame at the base.
            sp: stack_len.saturating_sub(Self::WORDS),
            words: [0; Self::WORDS],
        }
    }

    #[cfg(test)]
    pub(crate) fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }
}

/// Task control record.
#[derive(Debug)]
pub struct Tcb {
    pub(crate) name: &'static str,
    pub(crate) static_prio: Priority,
    pub(crate) effective_prio: Priority,
    pub(crate) state: TaskState,
    pub(crate) context: SavedContext,
    pub(crate) stack: StackRegion,
    pub(crate) created_at: TickCount,
    /// Arrival order stamp, taken when the task joins a wait list.
    pub(crate) arrival_seq: u64,
    /// Ledger key while delayed or pend-with-timeout.
    pub(crate) wake_at: Option<TickCount>,
    pub(crate) blocked_on: Option<WaitObject>,
    pub(crate) owned_mutexes: Vec<MutexId>,
    /// Outcome of the last blocking call, consumed by the task on resume.
    pub(crate) wake_result: Option<WakeReason>,
    /// Round-robin budget, in ticks, at the task's level.
    pub(crate) timeslice: u32,
    /// Set when the running task deletes itself; reclaimed at next switch.
    pub(crate) pending_delete: bool,
}

impl Tcb {
    pub(crate) fn new(
        name: &'static str,
        prio: Priority,
        stack_words: usize,
        now: TickCount,
        timeslice: u32,
    ) -> Self {
        Self {
            name,
            static_prio: prio,
            effective_prio: prio,
            state: TaskState::Created,
            context: SavedContext::initial(stack_words),
            stack: StackRegion::new(stack_words),
            created_at: now,
            arrival_seq: 0,
            wake_at: None,
            blocked_on: None,
            owned_mutexes: Vec::new(),
            wake_result: None,
            timeslice,
            pending_delete: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn static_priority(&self) -> Priority {
        self.static_prio
    }

    pub fn effective_priority(&self) -> Priority {
        self.effective_prio
    }

    /// True while the saved context and stack guard look sane.
    pub(crate) fn stack_sound(&self) -> bool {
        self.context.sp >= GUARD_WORDS
            && self.context.sp <= self.stack.len()
            && self.stack.guard_intact()
    }
}

/// Fixed-capacity arena of task control records.
pub struct TaskRegistry {
    slots: Vec<Option<Tcb>>,
}

impl TaskRegistry {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Places a record in the first free slot.
    pub(crate) fn allocate(&mut self, tcb: Tcb) -> KernelResult<TaskId> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::ResourceExhausted)?;
        self.slots[slot] = Some(tcb);
        Ok(TaskId(slot as u16))
    }

    pub(crate) fn tcb(&self, id: TaskId) -> KernelResult<&Tcb> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::InvalidState)
    }

    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> KernelResult<&mut Tcb> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::InvalidState)
    }

    /// Reclaims a slot, releasing the stack region with it.
    pub(crate) fn free(&mut self, id: TaskId) -> KernelResult<Tcb> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.take())
            .ok_or(KernelError::InvalidState)
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }
}
