//! Counting semaphores.
//!
//! A post with waiters present hands the token to the most urgent waiter
//! directly; the count never goes above zero while anyone is blocked.

use alloc::vec::Vec;

use kite_core::{KernelError, KernelResult, Timeout};

use crate::ipc::{DeferredPost, PendStatus, SemId, WaitList, WaitObject, WakeReason};
use crate::kernel::{Kernel, KernelState};
use crate::task::TaskId;
use crate::trace::SchedRecord;

pub(crate) struct SemObj {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) waiters: WaitList<()>,
}

impl Kernel {
    /// Creates a counting semaphore with an initial count and a ceiling.
    pub fn sem_create(&self, initial: u32, max: u32) -> KernelResult<SemId> {
        if max == 0 || initial > max {
            return Err(KernelError::InvalidState);
        }
        let mut state = self.state.lock();
        state
            .sems
            .insert(SemObj {
                count: initial,
                max,
                waiters: WaitList::new(),
            })
            .map(SemId)
    }

    /// Releases one token, waking the head waiter if any.
    pub fn sem_post(&self, sem: SemId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.sem_post_locked(&mut state, sem, &mut notes)
                .and_then(|_| self.maybe_resched(&mut state, &mut notes))
                .map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Interrupt-context post: records the release in the deferral ring.
    /// The wake happens at the next scheduler pass.
    pub fn sem_post_isr(&self, sem: SemId) -> KernelResult<()> {
        self.push_deferred(DeferredPost::Semaphore(sem))
    }

    pub(crate) fn sem_post_locked(
        &self,
        state: &mut KernelState,
        sem: SemId,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let woken = state.sems.get_mut(sem.0)?.waiters.pop_front();
        match woken {
            Some((task, ())) => self.wake_waiter(state, task, WakeReason::Acquired, notes),
            None => {
                let obj = state.sems.get_mut(sem.0)?;
                if obj.count >= obj.max {
                    return Err(KernelError::ResourceExhausted);
                }
                obj.count += 1;
                Ok(())
            }
        }
    }

    /// Takes one token or suspends the caller until one arrives. A bounded
    /// timeout registers a ledger deadline; expiry removes the wait-list
    /// entry and resumes the task with [`WakeReason::Timeout`].
    pub fn sem_pend(&self, sem: SemId, timeout: Timeout) -> KernelResult<PendStatus> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let taken = {
                let obj = state.sems.get_mut(sem.0)?;
                if obj.count > 0 {
                    obj.count -= 1;
                    true
                } else {
                    false
                }
            };
            if taken {
                Ok(PendStatus::Acquired)
            } else if !timeout.may_block() {
                Err(KernelError::Timeout)
            } else {
                let (cur, prio, seq) =
                    self.block_current(&mut state, WaitObject::Semaphore(sem), timeout, &mut notes)?;
                state.sems.get_mut(sem.0)?.waiters.insert(cur, prio, seq, ());
                self.reschedule(&mut state, &mut notes)
                    .map(|_| PendStatus::Blocked)
            }
        };
        self.finish(notes, result)
    }

    /// Destroys the semaphore; every waiter resumes with
    /// [`WakeReason::Deleted`].
    pub fn sem_delete(&self, sem: SemId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let mut obj = state.sems.remove(sem.0)?;
            for (task, ()) in obj.waiters.drain_all() {
                self.wake_waiter(&mut state, task, WakeReason::Deleted, &mut notes)?;
            }
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    pub fn sem_count(&self, sem: SemId) -> KernelResult<u32> {
        Ok(self.state.lock().sems.get(sem.0)?.count)
    }

    /// Blocked waiters in wake order, for diagnostics.
    pub fn sem_waiters(&self, sem: SemId) -> KernelResult<Vec<TaskId>> {
        Ok(self.state.lock().sems.get(sem.0)?.waiters.tasks())
    }
}
