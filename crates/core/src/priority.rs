//! Priority levels and the ready-set bitmap.
//!
//! Kite uses numerically ascending urgency: priority 0 is the most urgent
//! level, `PRIORITY_LEVELS - 1` the least. The highest level is reserved
//! for the idle task.

use core::fmt;

use crate::{KernelError, KernelResult};

/// Number of distinct priority levels supported by the kernel.
///
/// The ready-set bitmap is a single machine word, so the most-urgent scan
/// is one `trailing_zeros` regardless of task count.
pub const PRIORITY_LEVELS: u8 = 64;

/// Type-safe task priority level.
///
/// Lower numeric value means higher urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Most urgent priority level.
    pub const HIGHEST: Priority = Priority(0);

    /// Least urgent application level; the level below is reserved for idle.
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS - 2);

    /// Priority level reserved for the idle task.
    pub const IDLE: Priority = Priority(PRIORITY_LEVELS - 1);

    /// Creates a new priority level, rejecting out-of-range values and the
    /// reserved idle level.
    pub fn new(level: u8) -> KernelResult<Self> {
        if level >= PRIORITY_LEVELS - 1 {
            Err(KernelError::InvalidPriority)
        } else {
            Ok(Priority(level))
        }
    }

    /// Creates a priority without validation (const contexts).
    pub const fn new_unchecked(level: u8) -> Self {
        Priority(level)
    }

    /// Raw priority level.
    pub const fn level(self) -> u8 {
        self.0
    }

    /// Returns true if `self` is more urgent than `other`.
    pub const fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    /// The more urgent of the two priorities.
    pub fn most_urgent(self, other: Priority) -> Priority {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}

/// Fixed-width set of priority levels with O(1) most-urgent lookup.
///
/// One bit per level; bit `n` set means level `n` is occupied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySet {
    bits: u64,
}

impl PrioritySet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Marks a priority level as occupied.
    pub fn insert(&mut self, prio: Priority) {
        self.bits |= 1u64 << prio.level();
    }

    /// Marks a priority level as empty.
    pub fn remove(&mut self, prio: Priority) {
        self.bits &= !(1u64 << prio.level());
    }

    /// Returns true if the level is occupied.
    pub const fn contains(&self, prio: Priority) -> bool {
        (self.bits & (1u64 << prio.level())) != 0
    }

    /// Returns true if no level is occupied.
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Most urgent occupied level, if any. Single-word scan.
    pub fn most_urgent(&self) -> Option<Priority> {
        if self.bits == 0 {
            None
        } else {
            Some(Priority(self.bits.trailing_zeros() as u8))
        }
    }

    /// Removes every level from the set.
    pub fn clear(&mut self) {
        self.bits = 0;
    }
}
