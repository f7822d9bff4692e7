//! Call-recording port for host-side kernel tests.

use alloc::vec::Vec;

use spin::Mutex;

use kite_core::TickCount;

use crate::{Port, ProcessorMode, SleepMode, TrapContext, TrapSource};

/// Every hardware request the mock has observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCall {
    Reset,
    TimerConfigure(u32),
    TimerSuspend,
    TimerResume,
    TimerReloadOnce(TickCount),
    ClearTickInterrupt,
    EnterSleep(SleepMode),
}

/// Port implementation that records calls instead of touching hardware.
pub struct MockPort {
    calls: Mutex<Vec<PortCall>>,
    max_idle: TickCount,
    unwind: bool,
}

impl MockPort {
    /// Mock with a generous hardware maximum and unwinding supported.
    pub fn new() -> Self {
        Self::with_limits(u32::MAX as TickCount, true)
    }

    /// Mock with an explicit maximum idle interval and unwind capability.
    pub fn with_limits(max_idle: TickCount, unwind: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            max_idle,
            unwind,
        }
    }

    /// Snapshot of the recorded calls.
    pub fn calls(&self) -> Vec<PortCall> {
        self.calls.lock().clone()
    }

    /// True if the terminal fault path requested a reset.
    pub fn reset_requested(&self) -> bool {
        self.calls.lock().contains(&PortCall::Reset)
    }

    fn record(&self, call: PortCall) {
        self.calls.lock().push(call);
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for MockPort {
    fn reset(&self) {
        self.record(PortCall::Reset);
    }

    fn timer_configure(&self, cycles_per_tick: u32) {
        self.record(PortCall::TimerConfigure(cycles_per_tick));
    }

    fn timer_suspend(&self) {
        self.record(PortCall::TimerSuspend);
    }

    fn timer_resume(&self) {
        self.record(PortCall::TimerResume);
    }

    fn timer_reload_once(&self, ticks: TickCount) {
        self.record(PortCall::TimerReloadOnce(ticks));
    }

    fn max_idle_ticks(&self) -> TickCount {
        self.max_idle
    }

    fn clear_tick_interrupt(&self) {
        self.record(PortCall::ClearTickInterrupt);
    }

    fn enter_sleep(&self, mode: SleepMode) {
        self.record(PortCall::EnterSleep(mode));
    }

    fn unwind_supported(&self) -> bool {
        self.unwind
    }
}

/// Trap source returning a fixed, test-supplied capture.
pub struct MockTrap {
    context: TrapContext,
}

impl MockTrap {
    pub fn new(stack_pointer: usize, mode: ProcessorMode, code_region: core::ops::Range<usize>) -> Self {
        Self {
            context: TrapContext {
                stack_pointer,
                mode,
                code_region,
            },
        }
    }
}

impl TrapSource for MockTrap {
    fn trap_context(&self) -> TrapContext {
        self.context.clone()
    }
}
