//! Ownership mutexes with priority inheritance.
//!
//! A mutex has at most one owner; the same owner may nest locks. While a
//! more urgent task waits, the owner runs at the waiter's urgency so a
//! middle-priority task cannot fence the critical section. The boost
//! follows ownership chains (owner itself blocked on another mutex) up to
//! a fixed depth, and is withdrawn the moment its cause goes away: unlock,
//! waiter timeout, or the waiter's own priority dropping.

use alloc::vec::Vec;

use kite_core::{KernelError, KernelResult, Timeout};

use crate::ipc::{MutexId, PendStatus, WaitList, WaitObject, WakeReason};
use crate::kernel::{Kernel, KernelState};
use crate::task::TaskId;
use crate::trace::SchedRecord;

/// Longest ownership chain an inheritance walk will follow.
pub(crate) const PI_MAX_DEPTH: u8 = 8;

pub(crate) struct MutexObj {
    pub(crate) owner: Option<TaskId>,
    /// Recursive lock depth held by the owner.
    pub(crate) nest: u16,
    /// True while the owner runs boosted on this mutex's account.
    pub(crate) boosted: bool,
    pub(crate) waiters: WaitList<()>,
}

impl Kernel {
    pub fn mutex_create(&self) -> KernelResult<MutexId> {
        let mut state = self.state.lock();
        state
            .mutexes
            .insert(MutexObj {
                owner: None,
                nest: 0,
                boosted: false,
                waiters: WaitList::new(),
            })
            .map(MutexId)
    }

    /// Acquires the mutex for the running task, nesting if already owned
    /// by it, or suspends the caller behind more urgent waiters.
    pub fn mutex_lock(&self, mutex: MutexId, timeout: Timeout) -> KernelResult<PendStatus> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let cur = state.current;
            let owner = state.mutexes.get(mutex.0)?.owner;
            match owner {
                None => {
                    {
                        let obj = state.mutexes.get_mut(mutex.0)?;
                        obj.owner = Some(cur);
                        obj.nest = 1;
                    }
                    state.registry.tcb_mut(cur)?.owned_mutexes.push(mutex);
                    Ok(PendStatus::Acquired)
                }
                Some(o) if o == cur => {
                    let obj = state.mutexes.get_mut(mutex.0)?;
                    obj.nest = obj.nest.checked_add(1).ok_or(KernelError::InvalidState)?;
                    Ok(PendStatus::Acquired)
                }
                Some(_) => {
                    if !timeout.may_block() {
                        Err(KernelError::Timeout)
                    } else {
                        let (cur, prio, seq) = self.block_current(
                            &mut state,
                            WaitObject::Mutex(mutex),
                            timeout,
                            &mut notes,
                        )?;
                        state
                            .mutexes
                            .get_mut(mutex.0)?
                            .waiters
                            .insert(cur, prio, seq, ());
                        self.refresh_owner_priority(&mut state, mutex, 0, &mut notes)?;
                        self.reschedule(&mut state, &mut notes)
                            .map(|_| PendStatus::Blocked)
                    }
                }
            }
        };
        self.finish(notes, result)
    }

    /// Releases one nesting level. The final release restores the caller's
    /// priority and hands ownership to the head waiter, if any.
    pub fn mutex_unlock(&self, mutex: MutexId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let cur = state.current;
            {
                let obj = state.mutexes.get_mut(mutex.0)?;
                if obj.owner != Some(cur) {
                    return Err(KernelError::InvalidState);
                }
                obj.nest -= 1;
                if obj.nest > 0 {
                    return Ok(());
                }
                obj.owner = None;
                obj.boosted = false;
            }

            let tcb = state.registry.tcb_mut(cur)?;
            tcb.owned_mutexes.retain(|m| *m != mutex);
            let static_prio = tcb.static_prio;

            // Withdraw this mutex's boost; keep any driven by others.
            let inherited = self.inherited_ceiling(&state, cur)?;
            let target = inherited.map_or(static_prio, |b| static_prio.most_urgent(b));
            self.apply_effective(&mut state, cur, target, 0, &mut notes)?;

            self.transfer_to_head_waiter(&mut state, mutex, &mut notes)?;
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Destroys the mutex. An owner keeps running at its restored
    /// priority; every waiter resumes with [`WakeReason::Deleted`].
    pub fn mutex_delete(&self, mutex: MutexId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let mut obj = state.mutexes.remove(mutex.0)?;
            if let Some(owner) = obj.owner {
                let tcb = state.registry.tcb_mut(owner)?;
                tcb.owned_mutexes.retain(|m| *m != mutex);
                let static_prio = tcb.static_prio;
                let inherited = self.inherited_ceiling(&state, owner)?;
                let target = inherited.map_or(static_prio, |b| static_prio.most_urgent(b));
                self.apply_effective(&mut state, owner, target, 0, &mut notes)?;
            }
            for (task, ()) in obj.waiters.drain_all() {
                self.wake_waiter(&mut state, task, WakeReason::Deleted, &mut notes)?;
            }
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    pub fn mutex_owner(&self, mutex: MutexId) -> KernelResult<Option<TaskId>> {
        Ok(self.state.lock().mutexes.get(mutex.0)?.owner)
    }

    /// Hands a fully released mutex to its head waiter.
    fn transfer_to_head_waiter(
        &self,
        state: &mut KernelState,
        mutex: MutexId,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let next = state.mutexes.get_mut(mutex.0)?.waiters.pop_front();
        let Some((task, ())) = next else {
            return Ok(());
        };
        {
            let obj = state.mutexes.get_mut(mutex.0)?;
            obj.owner = Some(task);
            obj.nest = 1;
        }
        state.registry.tcb_mut(task)?.owned_mutexes.push(mutex);
        self.wake_waiter(state, task, WakeReason::Acquired, notes)?;
        // Remaining waiters were all less urgent than the head, but the
        // boost flag still needs recomputing against the new owner.
        self.refresh_owner_priority(state, mutex, 0, notes)
    }

    /// Releases a mutex held by a task being terminated. No priority
    /// restoration: the owner is going away.
    pub(crate) fn release_owned_on_terminate(
        &self,
        state: &mut KernelState,
        mutex: MutexId,
        owner: TaskId,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        {
            let obj = state.mutexes.get_mut(mutex.0)?;
            if obj.owner != Some(owner) {
                return Ok(());
            }
            obj.owner = None;
            obj.nest = 0;
            obj.boosted = false;
        }
        self.transfer_to_head_waiter(state, mutex, notes)
    }

    /// Most urgent head waiter across every mutex the task owns, the
    /// inherited component of its effective priority.
    pub(crate) fn inherited_ceiling(
        &self,
        state: &KernelState,
        task: TaskId,
    ) -> KernelResult<Option<kite_core::Priority>> {
        let owned = state.registry.tcb(task)?.owned_mutexes.clone();
        let mut best = None;
        for m in owned {
            if let Some(head) = state.mutexes.get(m.0)?.waiters.head_priority() {
                best = Some(match best {
                    None => head,
                    Some(b) => head.most_urgent(b),
                });
            }
        }
        Ok(best)
    }

    /// Recomputes the owner's effective priority from its static level
    /// and the head waiters of everything it owns, then propagates the
    /// change one hop further if the owner is itself blocked on a mutex.
    pub(crate) fn refresh_owner_priority(
        &self,
        state: &mut KernelState,
        mutex: MutexId,
        depth: u8,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        if depth >= PI_MAX_DEPTH {
            log::warn!("inheritance chain deeper than {PI_MAX_DEPTH}, truncating walk");
            return Ok(());
        }
        let (owner, head) = {
            let obj = state.mutexes.get(mutex.0)?;
            (obj.owner, obj.waiters.head_priority())
        };
        let Some(owner) = owner else {
            return Ok(());
        };

        let static_prio = state.registry.tcb(owner)?.static_prio;
        state.mutexes.get_mut(mutex.0)?.boosted =
            head.is_some_and(|h| h.is_more_urgent_than(static_prio));

        let inherited = self.inherited_ceiling(state, owner)?;
        let target = inherited.map_or(static_prio, |b| static_prio.most_urgent(b));
        self.apply_effective(state, owner, target, depth + 1, notes)
    }
}
