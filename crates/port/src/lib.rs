//! # kite-port
//!
//! The contract between the Kite kernel core and a hardware port. The core
//! never touches device registers; everything MCU-specific — arming the
//! periodic timer, entering a sleep mode, resetting the processor,
//! capturing trap state — goes through the traits defined here, implemented
//! once per target outside the core.
//!
//! [`mock`] provides a call-recording implementation for host tests.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod mock;

use core::ops::Range;

use kite_core::TickCount;

/// Sleep depths a port may offer.
///
/// Deeper modes save more power and cost more wake latency; the power
/// selector picks one from the computed idle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SleepMode {
    /// CPU clock gated, peripherals live, wake in a few cycles.
    Light,
    /// Core domain powered down, RAM retained.
    Deep,
    /// Everything off except the wake sources; resume is a reset.
    Off,
}

/// Processor execution mode at the time of a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    /// Task context; the active stack is the faulting task's stack.
    Thread,
    /// Interrupt context; the active stack is the main/handler stack.
    Handler,
}

/// Hardware services the kernel core consumes.
///
/// Implementations translate these requests into register writes for one
/// target. All methods take `&self`; ports keep whatever interior state
/// they need behind their own masking discipline.
pub trait Port: Send + Sync {
    /// Requests a processor reset. The kernel calls this only from the
    /// terminal fault path; it does not expect the call to return, but
    /// host-side ports may simply record it.
    fn reset(&self);

    /// Configures the periodic tick timer for the given cycles-per-tick.
    fn timer_configure(&self, cycles_per_tick: u32);

    /// Suspends the periodic tick timer.
    fn timer_suspend(&self);

    /// Resumes periodic ticking at the configured rate.
    fn timer_resume(&self);

    /// Reprograms the timer to fire once after `ticks`, for tickless idle.
    ///
    /// Callers clamp `ticks` to [`Port::max_idle_ticks`] first.
    fn timer_reload_once(&self, ticks: TickCount);

    /// Longest idle interval the timer hardware can represent, in ticks.
    fn max_idle_ticks(&self) -> TickCount;

    /// Clears a pending tick-timer interrupt flag.
    fn clear_tick_interrupt(&self);

    /// Commands entry into the given sleep mode. Returns on wake.
    fn enter_sleep(&self, mode: SleepMode);

    /// Whether this core supports instruction-pointer unwinding. Ports
    /// without a usable frame convention return false and fault reports
    /// carry no backtrace.
    fn unwind_supported(&self) -> bool;
}

/// Trap-entry state captured by the architecture-specific trap trampoline.
#[derive(Debug, Clone)]
pub struct TrapContext {
    /// Pre-trap stack pointer, expressed as a word offset into the
    /// faulting task's stack region.
    pub stack_pointer: usize,
    /// Which stack the pointer refers to depends on this mode.
    pub mode: ProcessorMode,
    /// Address range that holds executable code; stack words inside it are
    /// treated as return addresses during unwinding.
    pub code_region: Range<usize>,
}

/// One required operation: given trap entry, report the pre-trap stack
/// pointer and processor mode. Implemented per target architecture; the
/// unwinding logic itself stays portable in the core.
pub trait TrapSource {
    fn trap_context(&self) -> TrapContext;
}
