//! Sleep-mode selection for tickless idle.

use kite_core::{KernelError, KernelResult, TickCount};
use kite_port::SleepMode;

/// Maps an idle window to a sleep depth.
///
/// Each mode carries a minimum window: sleeping deeper than the window is
/// long costs more in wake latency than it saves. Thresholds are ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerPolicy {
    pub light_min: TickCount,
    pub deep_min: TickCount,
    pub off_min: TickCount,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            light_min: 2,
            deep_min: 100,
            off_min: 10_000,
        }
    }
}

impl PowerPolicy {
    /// Policy with explicit thresholds; they must be non-decreasing.
    pub fn new(
        light_min: TickCount,
        deep_min: TickCount,
        off_min: TickCount,
    ) -> KernelResult<Self> {
        if light_min > deep_min || deep_min > off_min {
            return Err(KernelError::InvalidState);
        }
        Ok(Self {
            light_min,
            deep_min,
            off_min,
        })
    }

    /// Deepest mode whose threshold the window clears, or `None` when the
    /// window is too short to be worth any sleep.
    pub fn select(&self, window: TickCount) -> Option<SleepMode> {
        if window >= self.off_min {
            Some(SleepMode::Off)
        } else if window >= self.deep_min {
            Some(SleepMode::Deep)
        } else if window >= self.light_min {
            Some(SleepMode::Light)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_by_threshold() {
        let policy = PowerPolicy::new(2, 10, 100).unwrap();
        assert_eq!(policy.select(1), None);
        assert_eq!(policy.select(2), Some(SleepMode::Light));
        assert_eq!(policy.select(9), Some(SleepMode::Light));
        assert_eq!(policy.select(10), Some(SleepMode::Deep));
        assert_eq!(policy.select(99), Some(SleepMode::Deep));
        assert_eq!(policy.select(100), Some(SleepMode::Off));
    }

    #[test]
    fn thresholds_must_be_monotonic() {
        assert!(PowerPolicy::new(10, 5, 100).is_err());
        assert!(PowerPolicy::new(1, 5, 4).is_err());
        assert!(PowerPolicy::new(5, 5, 5).is_ok());
    }
}
