//! Event-flag groups: a 32-bit condition word tasks can wait on.
//!
//! A waiter asks for a mask under ANY or ALL matching, optionally
//! consuming the matched bits on wake. A set operation examines waiters
//! in wake order, so an earlier clear-on-match waiter can consume bits a
//! later waiter would otherwise have seen.

use alloc::vec::Vec;

use kite_core::{KernelError, KernelResult, Timeout};

use crate::ipc::{DeferredPost, EventId, WaitList, WaitObject, WakeReason};
use crate::kernel::{Kernel, KernelState};
use crate::trace::SchedRecord;

/// How a wait mask is matched against the group's bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Any one bit of the mask suffices.
    Any,
    /// Every bit of the mask must be set.
    All,
}

/// Immediate outcome of an event wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// The condition already held; the matched bits.
    Matched(u32),
    /// Suspended until the condition is produced (or timeout/delete).
    Blocked,
}

/// One waiter's request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventWant {
    pub(crate) mask: u32,
    pub(crate) mode: EventMode,
    pub(crate) clear: bool,
}

pub(crate) struct EventObj {
    pub(crate) bits: u32,
    pub(crate) waiters: WaitList<EventWant>,
}

fn match_bits(bits: u32, mask: u32, mode: EventMode) -> Option<u32> {
    match mode {
        EventMode::Any => {
            let got = bits & mask;
            (got != 0).then_some(got)
        }
        EventMode::All => (bits & mask == mask).then_some(mask),
    }
}

impl Kernel {
    pub fn event_create(&self, initial: u32) -> KernelResult<EventId> {
        let mut state = self.state.lock();
        state
            .events
            .insert(EventObj {
                bits: initial,
                waiters: WaitList::new(),
            })
            .map(EventId)
    }

    /// Waits for a flag combination. An empty mask is rejected. With
    /// `clear`, the matched bits are consumed on wake.
    pub fn event_wait(
        &self,
        event: EventId,
        mask: u32,
        mode: EventMode,
        clear: bool,
        timeout: Timeout,
    ) -> KernelResult<EventStatus> {
        if mask == 0 {
            return Err(KernelError::InvalidState);
        }
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let matched = {
                let obj = state.events.get_mut(event.0)?;
                match match_bits(obj.bits, mask, mode) {
                    Some(got) => {
                        if clear {
                            obj.bits &= !got;
                        }
                        Some(got)
                    }
                    None => None,
                }
            };
            if let Some(got) = matched {
                Ok(EventStatus::Matched(got))
            } else if !timeout.may_block() {
                Err(KernelError::Timeout)
            } else {
                let (cur, prio, seq) =
                    self.block_current(&mut state, WaitObject::Event(event), timeout, &mut notes)?;
                state.events.get_mut(event.0)?.waiters.insert(
                    cur,
                    prio,
                    seq,
                    EventWant { mask, mode, clear },
                );
                self.reschedule(&mut state, &mut notes)
                    .map(|_| EventStatus::Blocked)
            }
        };
        self.finish(notes, result)
    }

    /// ORs bits into the group and wakes every waiter whose condition now
    /// holds, in wake order.
    pub fn event_set(&self, event: EventId, bits: u32) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.event_set_locked(&mut state, event, bits, &mut notes)
                .and_then(|_| self.maybe_resched(&mut state, &mut notes))
                .map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Interrupt-context set: deferred to the next scheduler pass.
    pub fn event_set_isr(&self, event: EventId, bits: u32) -> KernelResult<()> {
        self.push_deferred(DeferredPost::Event(event, bits))
    }

    pub(crate) fn event_set_locked(
        &self,
        state: &mut KernelState,
        event: EventId,
        bits: u32,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        state.events.get_mut(event.0)?.bits |= bits;

        let candidates = state.events.get(event.0)?.waiters.tasks();
        for task in candidates {
            let woke = {
                let obj = state.events.get_mut(event.0)?;
                let Some(want) = obj.waiters.want_of(task).copied() else {
                    continue;
                };
                match match_bits(obj.bits, want.mask, want.mode) {
                    None => None,
                    Some(got) => {
                        obj.waiters.remove_task(task);
                        if want.clear {
                            obj.bits &= !got;
                        }
                        Some(got)
                    }
                }
            };
            if let Some(got) = woke {
                self.wake_waiter(state, task, WakeReason::Events(got), notes)?;
            }
        }
        Ok(())
    }

    /// Clears bits from the group without touching waiters.
    pub fn event_clear(&self, event: EventId, bits: u32) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.events.get_mut(event.0)?.bits &= !bits;
        Ok(())
    }

    /// Current flag word.
    pub fn event_bits(&self, event: EventId) -> KernelResult<u32> {
        Ok(self.state.lock().events.get(event.0)?.bits)
    }

    /// Destroys the group; every waiter resumes with
    /// [`WakeReason::Deleted`].
    pub fn event_delete(&self, event: EventId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let mut obj = state.events.remove(event.0)?;
            for (task, _) in obj.waiters.drain_all() {
                self.wake_waiter(&mut state, task, WakeReason::Deleted, &mut notes)?;
            }
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }
}
