//! Monotonic tick clock and blocking timeouts.
//!
//! One tick is one firing of the periodic time-base interrupt. In tickless
//! operation the clock is advanced in one jump by the reconciliation path
//! instead of once per period.

use core::sync::atomic::{AtomicU64, Ordering};

/// Absolute or relative tick count.
pub type TickCount = u64;

/// Monotonic tick counter.
///
/// Pure data plus atomic increment; shared between the tick interrupt and
/// task context without further locking.
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU64,
}

impl TickClock {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Current absolute tick count.
    pub fn now(&self) -> TickCount {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advances the clock by `n` ticks and returns the new count.
    ///
    /// `n` is 1 from the periodic tick interrupt, or the reconciled idle
    /// duration when leaving tickless sleep.
    pub fn advance(&self, n: TickCount) -> TickCount {
        self.ticks.fetch_add(n, Ordering::AcqRel) + n
    }
}

/// Deadline for a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately instead of blocking.
    NoWait,
    /// Block for at most this many ticks.
    Ticks(TickCount),
    /// Block until the wake condition, however long that takes.
    Forever,
}

impl Timeout {
    /// Absolute wake tick for a ledger entry, if this timeout is bounded.
    pub fn deadline(self, now: TickCount) -> Option<TickCount> {
        match self {
            Timeout::Ticks(n) => Some(now.saturating_add(n)),
            Timeout::NoWait | Timeout::Forever => None,
        }
    }

    /// Returns true if the caller is willing to block at all.
    pub fn may_block(self) -> bool {
        !matches!(self, Timeout::NoWait)
    }
}
