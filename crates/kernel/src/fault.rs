//! Fault diagnosis: best-effort backtrace, then a terminal reset.
//!
//! When a trap fires or a stack guard is found scribbled, the kernel
//! produces a [`FaultReport`], emits it through the log, latches itself
//! faulted, and requests a processor reset from the port. No recovery is
//! attempted; the report is for the flight recorder, not for continuing.

use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::Ordering;

use kite_core::KernelError;
use kite_port::{ProcessorMode, TrapSource};

use crate::kernel::{Kernel, KernelState};
use crate::task::{TaskId, STACK_PAINT};

/// Frame cap for a fault backtrace.
pub const MAX_BACKTRACE_FRAMES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Processor trap (bus error, undefined instruction, ...).
    HardFault,
    /// A stack guard failed its check at context switch.
    StackOverflow,
}

/// What was known at the moment the system died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub kind: FaultKind,
    /// Faulting task, when the trap came from task context.
    pub task: Option<TaskId>,
    /// Stack pointer at fault, as a word offset into the task's stack.
    pub stack_pointer: usize,
    /// Probable return addresses, innermost first. Empty when unwinding
    /// is unsupported or nothing plausible was found.
    pub frames: Vec<usize>,
    /// Whether an unwind was attempted at all.
    pub unwound: bool,
}

/// Scans the used part of a stack for words that look like return
/// addresses. Conservative by construction: a word counts only if it
/// falls inside the executable region. The walk runs from the saved
/// stack pointer toward the stack base and stops at the paint sentinel,
/// the region bounds, or the frame cap, whichever comes first.
pub(crate) fn scan_stack_frames(
    words: &[usize],
    sp: usize,
    code_region: &Range<usize>,
) -> Vec<usize> {
    let mut frames = Vec::new();
    for &word in words.iter().skip(sp) {
        if word == STACK_PAINT {
            break;
        }
        if code_region.contains(&word) {
            frames.push(word);
            if frames.len() == MAX_BACKTRACE_FRAMES {
                break;
            }
        }
    }
    frames
}

impl Kernel {
    /// Builds and latches a fault report from trap-entry state, then
    /// requests a reset. The report is also returned for ports that
    /// stash it in noinit RAM before resetting.
    pub fn diagnose_fault(&self, trap: &dyn TrapSource) -> FaultReport {
        self.faulted.store(true, Ordering::Release);
        let ctx = trap.trap_context();
        let unwound = self.port.unwind_supported();

        let report = {
            let state = self.state.lock();
            // A handler-mode trap has no task to blame.
            let task = (ctx.mode == ProcessorMode::Thread).then_some(state.current);
            let frames = match task {
                Some(t) if unwound => state
                    .registry
                    .tcb(t)
                    .map(|tcb| {
                        scan_stack_frames(tcb.stack.words(), ctx.stack_pointer, &ctx.code_region)
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            FaultReport {
                kind: FaultKind::HardFault,
                task,
                stack_pointer: ctx.stack_pointer,
                frames,
                unwound,
            }
        };

        match report.task {
            Some(task) => log::error!(
                "hard fault in {task}, sp={}, {} frame(s) recovered",
                report.stack_pointer,
                report.frames.len()
            ),
            None => log::error!("hard fault in handler mode, sp={}", report.stack_pointer),
        }
        *self.last_fault.lock() = Some(report.clone());
        self.port.reset();
        report
    }

    /// Latches a stack overflow found at context switch. Returns the
    /// error the scheduler propagates; the caller routes it to the
    /// reset path once the state lock is gone.
    pub(crate) fn stack_overflow(&self, state: &KernelState, task: TaskId) -> KernelError {
        self.faulted.store(true, Ordering::Release);
        let (name, sp) = state
            .registry
            .tcb(task)
            .map(|tcb| (tcb.name, tcb.context.sp))
            .unwrap_or(("?", 0));
        log::error!("stack overflow in '{name}' ({task})");
        *self.last_fault.lock() = Some(FaultReport {
            kind: FaultKind::StackOverflow,
            task: Some(task),
            stack_pointer: sp,
            frames: Vec::new(),
            unwound: false,
        });
        KernelError::StackOverflow
    }

    /// The latched report, if the system has died.
    pub fn last_fault(&self) -> Option<FaultReport> {
        self.last_fault.lock().clone()
    }

    /// True once a fault has been latched; scheduling entry points refuse
    /// to run afterwards.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use kite_core::Priority;
    use kite_port::mock::{MockPort, MockTrap};

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    #[test]
    fn scan_keeps_only_code_region_words() {
        let code = 0x0800_0000..0x0802_0000;
        let words = [
            0x2000_1000,  // data address, skipped
            0x0800_1234,  // plausible return address
            0x0000_0000,
            0x0801_ff00,
            STACK_PAINT, // sentinel ends the walk
            0x0800_aaaa, // never reached
        ];
        let frames = scan_stack_frames(&words, 0, &code);
        assert_eq!(frames, vec![0x0800_1234, 0x0801_ff00]);
    }

    #[test]
    fn scan_respects_the_frame_cap_and_bounds() {
        let code = 0x1000..0x2000;
        let words = vec![0x1500usize; MAX_BACKTRACE_FRAMES + 8];
        assert_eq!(
            scan_stack_frames(&words, 0, &code).len(),
            MAX_BACKTRACE_FRAMES
        );
        // sp past the end yields nothing rather than panicking.
        assert!(scan_stack_frames(&words, words.len() + 4, &code).is_empty());
    }

    #[test]
    fn thread_mode_trap_blames_the_current_task() {
        let port = Arc::new(MockPort::new());
        let k = Kernel::builder().port(port.clone()).build().unwrap();
        let t = k.task_create("victim", prio(3), 64).unwrap();

        let trap = MockTrap::new(8, ProcessorMode::Thread, 0x1000..0x2000);
        let report = k.diagnose_fault(&trap);
        assert_eq!(report.kind, FaultKind::HardFault);
        assert_eq!(report.task, Some(t));
        assert!(report.unwound);
        assert!(port.reset_requested());
        assert!(k.is_faulted());
        assert_eq!(k.last_fault(), Some(report));
        // The dead kernel refuses further scheduling.
        assert!(matches!(
            k.schedule(),
            Err(KernelError::UnrecoverableFault)
        ));
        assert!(matches!(
            k.on_tick(),
            Err(KernelError::UnrecoverableFault)
        ));
    }

    #[test]
    fn handler_mode_trap_names_no_task() {
        let k = Kernel::builder()
            .port(Arc::new(MockPort::new()))
            .build()
            .unwrap();
        let trap = MockTrap::new(4, ProcessorMode::Handler, 0x1000..0x2000);
        let report = k.diagnose_fault(&trap);
        assert_eq!(report.task, None);
        assert!(report.frames.is_empty());
    }

    #[test]
    fn unsupported_unwind_yields_a_minimal_report() {
        let port = Arc::new(MockPort::with_limits(100, false));
        let k = Kernel::builder().port(port).build().unwrap();
        let _t = k.task_create("t", prio(3), 64).unwrap();
        let trap = MockTrap::new(8, ProcessorMode::Thread, 0x1000..0x2000);
        let report = k.diagnose_fault(&trap);
        assert!(!report.unwound);
        assert!(report.frames.is_empty());
    }
}
