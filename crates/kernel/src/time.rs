//! Tick processing and tickless idle.
//!
//! `on_tick` is the periodic-mode entry point: advance the clock, drain
//! deferred ISR posts, wake the due, charge the running task's slice, and
//! dispatch. The tickless path suspends the periodic timer across a
//! computed idle window and reconciles the clock on wake, so time-based
//! wakes land on the same ticks they would have in periodic mode.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use kite_core::{KernelError, KernelResult, TickCount};
use kite_port::SleepMode;

use crate::kernel::{Kernel, KernelState};
use crate::task::{TaskState, TaskId};
use crate::trace::SchedRecord;

/// Outstanding tickless window, armed by `enter_idle`.
pub(crate) struct TicklessPlan {
    pub(crate) window: TickCount,
}

impl Kernel {
    /// Handles one periodic tick. Called from the tick interrupt's
    /// bottom half (or a test harness driving time by hand).
    pub fn on_tick(&self) -> KernelResult<TaskId> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(KernelError::UnrecoverableFault);
        }
        let now = self.clock.advance(1);
        let mut notes = Vec::new();
        notes.push(SchedRecord::Tick(now));
        let result = {
            let mut state = self.state.lock();
            self.drain_deferred(&mut state, &mut notes);
            self.wake_due(&mut state, now, &mut notes)
                .and_then(|_| self.charge_timeslice(&mut state, &mut notes))
                .and_then(|_| self.reschedule(&mut state, &mut notes))
        };
        self.finish(notes, result)
    }

    /// Wakes every ledger entry due at or before `now`. Delayed tasks
    /// simply become ready; blocked tasks leave their wait list and
    /// resume with a timeout outcome.
    pub(crate) fn wake_due(
        &self,
        state: &mut KernelState,
        now: TickCount,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        for (tick, task) in state.ledger.pop_due(now) {
            let Ok(tcb) = state.registry.tcb(task) else {
                // Deleted after registering; nothing to wake.
                continue;
            };
            if tcb.wake_at != Some(tick) {
                continue;
            }
            match tcb.state {
                TaskState::Delayed => {
                    let tcb = state.registry.tcb_mut(task)?;
                    tcb.wake_at = None;
                    tcb.state = TaskState::Ready;
                    let prio = tcb.effective_prio;
                    state.ready.push_tail(task, prio);
                    state.resched_pending = true;
                    notes.push(SchedRecord::Ready(task));
                }
                TaskState::Blocked => {
                    let on = tcb.blocked_on;
                    if let Some(on) = on {
                        self.detach_from_wait_object(state, task, on, notes)?;
                    }
                    self.wake_waiter(state, task, crate::ipc::WakeReason::Timeout, notes)?;
                }
                _ => {
                    state.registry.tcb_mut(task)?.wake_at = None;
                }
            }
        }
        Ok(())
    }

    /// Burns one tick of the runner's round-robin budget. An exhausted
    /// slice rotates to the lane tail only when a peer is queued there;
    /// a task alone at its level just gets a fresh slice.
    pub(crate) fn charge_timeslice(
        &self,
        state: &mut KernelState,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let cur = state.current;
        if cur == state.idle {
            return Ok(());
        }
        let (spent, prio) = {
            let tcb = state.registry.tcb_mut(cur)?;
            if tcb.state != TaskState::Running {
                return Ok(());
            }
            tcb.timeslice = tcb.timeslice.saturating_sub(1);
            (tcb.timeslice == 0, tcb.effective_prio)
        };
        if !spent {
            return Ok(());
        }
        if state.ready.lane_len(prio) > 0 {
            let tcb = state.registry.tcb_mut(cur)?;
            tcb.state = TaskState::Ready;
            state.ready.push_tail(cur, prio);
            state.resched_pending = true;
            notes.push(SchedRecord::Ready(cur));
        } else {
            state.registry.tcb_mut(cur)?.timeslice = self.config.timeslice_ticks;
        }
        Ok(())
    }

    /// How long the system could sleep right now: up to the next ledger
    /// wake, clamped to the port timer's longest programmable stretch.
    /// `None` when any task is runnable or a wake is already due.
    pub fn idle_window(&self) -> Option<TickCount> {
        let state = self.state.lock();
        self.idle_window_locked(&state)
    }

    fn idle_window_locked(&self, state: &KernelState) -> Option<TickCount> {
        if state.current != state.idle || !state.ready.is_empty() || state.resched_pending {
            return None;
        }
        // A post queued from interrupt context is a wake that has not
        // been applied yet; it bars sleep until the next pass drains it.
        let pending = critical_section::with(|cs| !self.deferred.borrow_ref(cs).is_empty());
        if pending {
            return None;
        }
        let hw_max = self.port.max_idle_ticks();
        let now = self.clock.now();
        let window = match state.ledger.next_wake() {
            Some(wake) if wake <= now => return None,
            Some(wake) => (wake - now).min(hw_max),
            None => hw_max,
        };
        (window > 0).then_some(window)
    }

    /// Arms a tickless window: suspends the periodic timer, programs a
    /// one-shot for the window, consults the power policy, and sleeps.
    /// Returns the chosen sleep mode, or `None` when the system was not
    /// idle enough to sleep at all.
    pub fn enter_idle(&self) -> KernelResult<Option<SleepMode>> {
        let mut notes = Vec::new();
        let armed = {
            let mut state = self.state.lock();
            if state.tickless.is_some() {
                return Err(KernelError::InvalidState);
            }
            // Apply anything interrupt context queued since the last
            // pass before deciding whether the system is idle at all.
            self.drain_deferred(&mut state, &mut notes);
            if let Err(e) = self.maybe_resched(&mut state, &mut notes) {
                drop(state);
                return self.finish(notes, Err(e));
            }
            match self.idle_window_locked(&state) {
                None => None,
                Some(window) => {
                    self.port.timer_suspend();
                    self.port.timer_reload_once(window);
                    state.tickless = Some(TicklessPlan { window });
                    notes.push(SchedRecord::TicklessEnter(window));
                    log::debug!("tickless idle for up to {window} ticks");
                    Some(window)
                }
            }
        };
        // The sleep itself happens outside the state lock: the wake
        // interrupt must be able to queue deferred posts.
        let mode = armed.and_then(|window| self.config.power_policy.select(window));
        if let Some(mode) = mode {
            self.port.enter_sleep(mode);
        }
        self.finish(notes, Ok(()))?;
        Ok(mode)
    }

    /// Reconciles the clock after a tickless window and resumes periodic
    /// ticking. `elapsed` is how many ticks the hardware actually slept,
    /// clamped to the armed window; an early wake (interrupt) passes the
    /// shorter true figure so no time is invented.
    pub fn resume_from_idle(&self, elapsed: TickCount) -> KernelResult<TaskId> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let Some(plan) = state.tickless.take() else {
                return Err(KernelError::InvalidState);
            };
            let slept = elapsed.min(plan.window);
            let now = self.clock.advance(slept);
            notes.push(SchedRecord::TicklessExit(slept));
            self.port.clear_tick_interrupt();
            self.port.timer_resume();
            self.drain_deferred(&mut state, &mut notes);
            self.wake_due(&mut state, now, &mut notes)
                .and_then(|_| self.reschedule(&mut state, &mut notes))
        };
        self.finish(notes, result)
    }
}
