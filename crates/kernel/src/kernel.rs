//! Kernel context: configuration, task lifecycle, and the scheduler.
//!
//! All mutable kernel state — task registry, ready queue, delay ledger,
//! object pools, current-task pointer — lives in one [`KernelState`] value
//! behind the kernel's critical-section lock. Nothing is ambient; every
//! path goes through the [`Kernel`] handle created by the builder.

use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use kite_core::{KernelError, KernelResult, Priority, TickClock, TickCount, Timeout};
use kite_port::Port;

use crate::fault::FaultReport;
use crate::ipc::event::EventObj;
use crate::ipc::mutex::MutexObj;
use crate::ipc::queue::QueueObj;
use crate::ipc::semaphore::SemObj;
use crate::ipc::{DeferredPost, Pool, WaitObject, WakeReason};
use crate::ledger::DelayLedger;
use crate::power::PowerPolicy;
use crate::readyq::ReadyQueue;
use crate::sync::{Arc, Mutex};
use crate::task::{TaskId, TaskRegistry, TaskState, Tcb, MIN_STACK_WORDS};
use crate::time::TicklessPlan;
use crate::trace::{SchedRecord, TraceHook};

/// Capacity of the post-only ISR deferral ring.
pub(crate) const DEFERRED_POSTS: usize = 32;

/// Sizing and policy for one kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    pub max_tasks: usize,
    pub max_semaphores: usize,
    pub max_mutexes: usize,
    pub max_events: usize,
    pub max_queues: usize,
    /// Round-robin budget at one priority level, in ticks.
    pub timeslice_ticks: u32,
    /// Hardware timer reload value handed to the port at startup.
    pub cycles_per_tick: u32,
    pub idle_stack_words: usize,
    pub power_policy: PowerPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "kite",
            max_tasks: 16,
            max_semaphores: 8,
            max_mutexes: 8,
            max_events: 4,
            max_queues: 4,
            timeslice_ticks: 1,
            cycles_per_tick: 10_000,
            idle_stack_words: 64,
            power_policy: PowerPolicy::default(),
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn max_tasks(mut self, max: usize) -> Self {
        self.config.max_tasks = max;
        self
    }

    /// Object pool capacities: semaphores, mutexes, events, queues.
    pub fn pool_sizes(mut self, sems: usize, mutexes: usize, events: usize, queues: usize) -> Self {
        self.config.max_semaphores = sems;
        self.config.max_mutexes = mutexes;
        self.config.max_events = events;
        self.config.max_queues = queues;
        self
    }

    pub fn timeslice_ticks(mut self, ticks: u32) -> Self {
        self.config.timeslice_ticks = ticks;
        self
    }

    pub fn cycles_per_tick(mut self, cycles: u32) -> Self {
        self.config.cycles_per_tick = cycles;
        self
    }

    pub fn idle_stack_words(mut self, words: usize) -> Self {
        self.config.idle_stack_words = words;
        self
    }

    pub fn power_policy(mut self, policy: PowerPolicy) -> Self {
        self.config.power_policy = policy;
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}

/// Everything the scheduler mutates, guarded by one lock.
pub(crate) struct KernelState {
    pub(crate) registry: TaskRegistry,
    pub(crate) ready: ReadyQueue,
    pub(crate) ledger: DelayLedger,
    pub(crate) current: TaskId,
    pub(crate) idle: TaskId,
    /// Arrival stamp source for wait-list FIFO tie-breaks.
    pub(crate) seq: u64,
    pub(crate) sems: Pool<SemObj>,
    pub(crate) mutexes: Pool<MutexObj>,
    pub(crate) events: Pool<EventObj>,
    pub(crate) queues: Pool<QueueObj>,
    pub(crate) resched_pending: bool,
    pub(crate) tickless: Option<TicklessPlan>,
}

pub struct KernelBuilder {
    config: KernelConfig,
    port: Option<Arc<dyn Port>>,
    trace: Option<TraceHook>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            port: None,
            trace: None,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: Arc<dyn Port>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> KernelResult<Kernel> {
        let port = self.port.ok_or(KernelError::InvalidState)?;
        Kernel::new(self.config, port, self.trace)
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel context.
///
/// Owned by the runtime initialization path; application and interrupt
/// code reach kernel services only through this handle.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) port: Arc<dyn Port>,
    pub(crate) clock: TickClock,
    pub(crate) state: Mutex<KernelState>,
    /// Post-only ring filled in interrupt context, drained at the next
    /// scheduler pass. Fixed capacity; the ISR side never allocates.
    pub(crate) deferred:
        critical_section::Mutex<RefCell<heapless::Deque<DeferredPost, DEFERRED_POSTS>>>,
    trace: Mutex<Option<TraceHook>>,
    pub(crate) faulted: AtomicBool,
    pub(crate) last_fault: Mutex<Option<FaultReport>>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    fn new(
        config: KernelConfig,
        port: Arc<dyn Port>,
        trace: Option<TraceHook>,
    ) -> KernelResult<Self> {
        if config.max_tasks < 2 || config.timeslice_ticks == 0 {
            return Err(KernelError::InvalidState);
        }

        let mut registry = TaskRegistry::with_capacity(config.max_tasks);
        let stack = config.idle_stack_words.max(MIN_STACK_WORDS);
        let mut idle_tcb = Tcb::new("idle", Priority::IDLE, stack, 0, config.timeslice_ticks);
        // The idle task is permanently eligible and starts as the runner.
        idle_tcb.state = TaskState::Running;
        let idle = registry.allocate(idle_tcb)?;

        let state = KernelState {
            registry,
            ready: ReadyQueue::new(),
            ledger: DelayLedger::new(),
            current: idle,
            idle,
            seq: 0,
            sems: Pool::with_capacity(config.max_semaphores),
            mutexes: Pool::with_capacity(config.max_mutexes),
            events: Pool::with_capacity(config.max_events),
            queues: Pool::with_capacity(config.max_queues),
            resched_pending: false,
            tickless: None,
        };

        port.timer_configure(config.cycles_per_tick);
        log::debug!("kernel '{}' initialized, idle is {idle}", config.name);

        Ok(Self {
            config,
            port,
            clock: TickClock::new(),
            state: Mutex::new(state),
            deferred: critical_section::Mutex::new(RefCell::new(heapless::Deque::new())),
            trace: Mutex::new(trace),
            faulted: AtomicBool::new(false),
            last_fault: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn set_trace_hook(&self, hook: Option<TraceHook>) {
        *self.trace.lock() = hook;
    }

    /// Current absolute tick count.
    pub fn now(&self) -> TickCount {
        self.clock.now()
    }

    /// The task currently dispatched (the idle task counts).
    pub fn current_task(&self) -> TaskId {
        self.state.lock().current
    }

    /// Handle of the permanently-ready idle task.
    pub fn idle_task(&self) -> TaskId {
        self.state.lock().idle
    }

    pub fn task_state(&self, task: TaskId) -> KernelResult<TaskState> {
        Ok(self.state.lock().registry.tcb(task)?.state)
    }

    pub fn task_static_priority(&self, task: TaskId) -> KernelResult<Priority> {
        Ok(self.state.lock().registry.tcb(task)?.static_prio)
    }

    pub fn task_effective_priority(&self, task: TaskId) -> KernelResult<Priority> {
        Ok(self.state.lock().registry.tcb(task)?.effective_prio)
    }

    /// Consumes the outcome of the task's last blocking call.
    pub fn take_wake_reason(&self, task: TaskId) -> KernelResult<Option<WakeReason>> {
        Ok(self.state.lock().registry.tcb_mut(task)?.wake_result.take())
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Creates a task: allocates and paints its stack, seeds the initial
    /// context, and queues it at its priority. The new task runs at the
    /// next scheduler pass if it outranks the current one.
    pub fn task_create(
        &self,
        name: &'static str,
        prio: Priority,
        stack_words: usize,
    ) -> KernelResult<TaskId> {
        if stack_words < MIN_STACK_WORDS {
            return Err(KernelError::InvalidState);
        }
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let mut tcb = Tcb::new(name, prio, stack_words, now, self.config.timeslice_ticks);
            tcb.state = TaskState::Ready;
            match state.registry.allocate(tcb) {
                Ok(task) => {
                    state.ready.push_tail(task, prio);
                    state.resched_pending = true;
                    notes.push(SchedRecord::Ready(task));
                    log::debug!("created '{name}' as {task} at {prio}");
                    self.maybe_resched(&mut state, &mut notes).map(|_| task)
                }
                Err(err) => Err(err),
            }
        };
        self.finish(notes, result)
    }

    /// Deletes a task and releases its stack. Deleting the running task
    /// defers reclamation to the context switch this call triggers.
    pub fn task_delete(&self, task: TaskId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if task == state.idle {
                return Err(KernelError::InvalidState);
            }
            if !state.registry.contains(task) {
                return Err(KernelError::InvalidState);
            }
            if task == state.current
                && state.registry.tcb(task)?.state == TaskState::Running
            {
                state.registry.tcb_mut(task)?.pending_delete = true;
                state.resched_pending = true;
            } else {
                self.terminate(&mut state, task, &mut notes)?;
            }
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Takes a READY or RUNNING task out of scheduling until resumed.
    pub fn task_suspend(&self, task: TaskId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if task == state.idle {
                return Err(KernelError::InvalidState);
            }
            let (st, prio) = {
                let tcb = state.registry.tcb(task)?;
                (tcb.state, tcb.effective_prio)
            };
            match st {
                TaskState::Ready => {
                    state.ready.remove(task, prio);
                    state.registry.tcb_mut(task)?.state = TaskState::Suspended;
                }
                TaskState::Running => {
                    state.registry.tcb_mut(task)?.state = TaskState::Suspended;
                    state.resched_pending = true;
                }
                _ => return Err(KernelError::InvalidState),
            }
            notes.push(SchedRecord::Sleep(task));
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Makes a suspended task eligible again, at the tail of its level.
    pub fn task_resume(&self, task: TaskId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let tcb = state.registry.tcb_mut(task)?;
            if tcb.state != TaskState::Suspended {
                return Err(KernelError::InvalidState);
            }
            tcb.state = TaskState::Ready;
            let prio = tcb.effective_prio;
            state.ready.push_tail(task, prio);
            state.resched_pending = true;
            notes.push(SchedRecord::Ready(task));
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Changes a task's static priority, rethreading it through the ready
    /// queue or wait list and recomputing any inheritance it drives.
    pub fn set_priority(&self, task: TaskId, prio: Priority) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if task == state.idle {
                return Err(KernelError::InvalidState);
            }
            state.registry.tcb_mut(task)?.static_prio = prio;
            let inherited = self.inherited_ceiling(&state, task)?;
            let target = inherited.map_or(prio, |b| prio.most_urgent(b));
            self.apply_effective(&mut state, task, target, 0, &mut notes)?;
            state.resched_pending = true;
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Puts the running task to sleep for `ticks` ticks.
    pub fn delay(&self, ticks: TickCount) -> KernelResult<()> {
        if ticks == 0 {
            return Err(KernelError::InvalidState);
        }
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let cur = state.current;
            if cur == state.idle {
                return Err(KernelError::InvalidState);
            }
            let wake_at = self.clock.now().saturating_add(ticks);
            {
                let tcb = state.registry.tcb_mut(cur)?;
                if tcb.state != TaskState::Running {
                    return Err(KernelError::InvalidState);
                }
                tcb.state = TaskState::Delayed;
                tcb.wake_at = Some(wake_at);
            }
            state.ledger.insert(wake_at, cur);
            state.resched_pending = true;
            notes.push(SchedRecord::Sleep(cur));
            self.reschedule(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Voluntarily hands the CPU to the next task at the same level.
    pub fn yield_current(&self) -> KernelResult<TaskId> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let cur = state.current;
            if cur != state.idle {
                let tcb = state.registry.tcb_mut(cur)?;
                if tcb.state == TaskState::Running {
                    tcb.state = TaskState::Ready;
                    let prio = tcb.effective_prio;
                    state.ready.push_tail(cur, prio);
                    notes.push(SchedRecord::Ready(cur));
                }
            }
            self.reschedule(&mut state, &mut notes)
        };
        self.finish(notes, result)
    }

    /// Runs one scheduler pass: drains deferred ISR posts, then dispatches
    /// the most urgent ready task.
    pub fn schedule(&self) -> KernelResult<TaskId> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(KernelError::UnrecoverableFault);
        }
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.drain_deferred(&mut state, &mut notes);
            self.reschedule(&mut state, &mut notes)
        };
        self.finish(notes, result)
    }

    // ------------------------------------------------------------------
    // Scheduler internals
    // ------------------------------------------------------------------

    /// Core dispatch decision. Bounded work: one bitmap scan plus O(1)
    /// queue operations, independent of the number of tasks.
    pub(crate) fn reschedule(
        &self,
        state: &mut KernelState,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<TaskId> {
        let cur = state.current;
        let cur_running = state
            .registry
            .tcb(cur)
            .map(|t| t.state == TaskState::Running)
            .unwrap_or(false);

        if cur_running {
            let tcb = state.registry.tcb(cur)?;
            if !tcb.pending_delete {
                // The runner keeps the CPU unless a strictly more urgent
                // lane is occupied; equals wait for the tick boundary.
                match state.ready.most_urgent_level() {
                    Some(top) if top.is_more_urgent_than(tcb.effective_prio) => {}
                    _ => {
                        state.resched_pending = false;
                        return Ok(cur);
                    }
                }
            }
        }

        if cur_running {
            if !state.registry.tcb(cur)?.stack_sound() {
                return Err(self.stack_overflow(state, cur));
            }
            if state.registry.tcb(cur)?.pending_delete {
                self.terminate(state, cur, notes)?;
            } else {
                let tcb = state.registry.tcb_mut(cur)?;
                tcb.state = TaskState::Ready;
                let prio = tcb.effective_prio;
                if cur != state.idle {
                    state.ready.push_tail(cur, prio);
                    notes.push(SchedRecord::Ready(cur));
                }
            }
        }

        let next = state.ready.pop_most_urgent().unwrap_or(state.idle);
        {
            let tcb = state.registry.tcb_mut(next)?;
            tcb.state = TaskState::Running;
            tcb.timeslice = self.config.timeslice_ticks;
        }
        state.current = next;
        state.resched_pending = false;

        if next != cur {
            notes.push(SchedRecord::Switch { from: cur, to: next });
            log::debug!("context switch {cur} -> {next}");
        }
        Ok(next)
    }

    pub(crate) fn maybe_resched(
        &self,
        state: &mut KernelState,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<TaskId> {
        if state.resched_pending {
            self.reschedule(state, notes)
        } else {
            Ok(state.current)
        }
    }

    /// Suspends the running task on a synchronization object. Registers a
    /// ledger entry when the timeout is bounded; the caller inserts the
    /// task into the object's wait list with the returned arrival stamp.
    pub(crate) fn block_current(
        &self,
        state: &mut KernelState,
        on: WaitObject,
        timeout: Timeout,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<(TaskId, Priority, u64)> {
        let cur = state.current;
        if cur == state.idle {
            // The idle task never blocks.
            return Err(KernelError::InvalidState);
        }
        let now = self.clock.now();
        let seq = state.seq;
        state.seq += 1;

        let prio = {
            let tcb = state.registry.tcb_mut(cur)?;
            if tcb.state != TaskState::Running {
                return Err(KernelError::InvalidState);
            }
            tcb.state = TaskState::Blocked;
            tcb.blocked_on = Some(on);
            tcb.arrival_seq = seq;
            tcb.wake_result = None;
            tcb.wake_at = timeout.deadline(now);
            tcb.effective_prio
        };
        if let Some(deadline) = timeout.deadline(now) {
            state.ledger.insert(deadline, cur);
        }
        state.resched_pending = true;
        notes.push(SchedRecord::Sleep(cur));
        Ok((cur, prio, seq))
    }

    /// Moves a blocked task back to READY with the given outcome,
    /// cancelling its timeout registration. Atomic with respect to the
    /// timeout path: both run under the kernel-state lock, and whichever
    /// fires first removes the other's handle.
    pub(crate) fn wake_waiter(
        &self,
        state: &mut KernelState,
        task: TaskId,
        reason: WakeReason,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let (wake_at, prio) = {
            let tcb = state.registry.tcb_mut(task)?;
            tcb.blocked_on = None;
            tcb.state = TaskState::Ready;
            tcb.wake_result = Some(reason);
            (tcb.wake_at.take(), tcb.effective_prio)
        };
        if let Some(at) = wake_at {
            state.ledger.remove(at, task);
        }
        state.ready.push_tail(task, prio);
        state.resched_pending = true;
        notes.push(SchedRecord::Ready(task));
        Ok(())
    }

    /// Removes a task from whatever wait list it sits on, deflating any
    /// priority boost it was driving.
    pub(crate) fn detach_from_wait_object(
        &self,
        state: &mut KernelState,
        task: TaskId,
        on: WaitObject,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        match on {
            WaitObject::Semaphore(id) => {
                state.sems.get_mut(id.0)?.waiters.remove_task(task);
            }
            WaitObject::Mutex(id) => {
                state.mutexes.get_mut(id.0)?.waiters.remove_task(task);
                self.refresh_owner_priority(state, id, 0, notes)?;
            }
            WaitObject::Event(id) => {
                state.events.get_mut(id.0)?.waiters.remove_task(task);
            }
            WaitObject::Queue(id) => {
                state.queues.get_mut(id.0)?.waiters.remove_task(task);
            }
        }
        Ok(())
    }

    /// Changes a task's effective priority and rethreads it accordingly.
    /// Recurses down a mutex ownership chain at most `PI_MAX_DEPTH` hops.
    pub(crate) fn apply_effective(
        &self,
        state: &mut KernelState,
        task: TaskId,
        new_eff: Priority,
        depth: u8,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let (old, st, blocked_on) = {
            let tcb = state.registry.tcb(task)?;
            (tcb.effective_prio, tcb.state, tcb.blocked_on)
        };
        if old == new_eff {
            return Ok(());
        }
        state.registry.tcb_mut(task)?.effective_prio = new_eff;
        state.resched_pending = true;

        match st {
            TaskState::Ready => {
                state.ready.remove(task, old);
                state.ready.push_tail(task, new_eff);
            }
            TaskState::Blocked => match blocked_on {
                Some(WaitObject::Mutex(m)) => {
                    state.mutexes.get_mut(m.0)?.waiters.reorder(task, new_eff);
                    self.refresh_owner_priority(state, m, depth, notes)?;
                }
                Some(WaitObject::Semaphore(s)) => {
                    state.sems.get_mut(s.0)?.waiters.reorder(task, new_eff);
                }
                Some(WaitObject::Event(e)) => {
                    state.events.get_mut(e.0)?.waiters.reorder(task, new_eff);
                }
                Some(WaitObject::Queue(q)) => {
                    state.queues.get_mut(q.0)?.waiters.reorder(task, new_eff);
                }
                None => {}
            },
            _ => {}
        }
        Ok(())
    }

    /// Final teardown of a task that is not the current runner (or is the
    /// runner being reclaimed at a switch).
    pub(crate) fn terminate(
        &self,
        state: &mut KernelState,
        task: TaskId,
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        let (st, prio, wake_at, blocked_on, owned) = {
            let tcb = state.registry.tcb(task)?;
            (
                tcb.state,
                tcb.effective_prio,
                tcb.wake_at,
                tcb.blocked_on,
                tcb.owned_mutexes.clone(),
            )
        };

        match st {
            TaskState::Ready => {
                state.ready.remove(task, prio);
            }
            TaskState::Blocked => {
                if let Some(on) = blocked_on {
                    self.detach_from_wait_object(state, task, on, notes)?;
                }
            }
            _ => {}
        }
        if let Some(at) = wake_at {
            state.ledger.remove(at, task);
        }

        // Held mutexes pass to their next waiters; a terminated owner must
        // not leave anyone blocked forever.
        for m in owned {
            self.release_owned_on_terminate(state, m, task, notes)?;
        }

        state.registry.tcb_mut(task)?.state = TaskState::Terminated;
        let tcb = state.registry.free(task)?;
        log::debug!("terminated '{}' ({task})", tcb.name());
        Ok(())
    }

    /// Applies every post recorded in interrupt context since the last
    /// pass. Wakes go to READY here; the dispatch decision is the
    /// reschedule that follows.
    pub(crate) fn drain_deferred(&self, state: &mut KernelState, notes: &mut Vec<SchedRecord>) {
        loop {
            let post = critical_section::with(|cs| self.deferred.borrow_ref_mut(cs).pop_front());
            let Some(post) = post else {
                break;
            };
            let outcome = match post {
                DeferredPost::Semaphore(id) => self.sem_post_locked(state, id, notes),
                DeferredPost::Event(id, bits) => self.event_set_locked(state, id, bits, notes),
                DeferredPost::Queue(id, msg) => self.queue_send_locked(state, id, &msg, notes),
            };
            if let Err(err) = outcome {
                log::warn!("deferred ISR post dropped: {err}");
            }
        }
    }

    /// Queues a post from interrupt context. Non-blocking; never touches
    /// the scheduler.
    pub(crate) fn push_deferred(&self, post: DeferredPost) -> KernelResult<()> {
        critical_section::with(|cs| {
            self.deferred
                .borrow_ref_mut(cs)
                .push_back(post)
                .map_err(|_| KernelError::ResourceExhausted)
        })
    }

    /// Emits trace records after the state lock has been dropped, and
    /// routes a stack overflow to the terminal reset path.
    pub(crate) fn finish<T>(
        &self,
        notes: Vec<SchedRecord>,
        result: KernelResult<T>,
    ) -> KernelResult<T> {
        let hook = self.trace.lock().clone();
        if let Some(hook) = hook {
            for note in &notes {
                hook(note);
            }
        }
        if matches!(result, Err(KernelError::StackOverflow)) {
            self.port.reset();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::MIN_STACK_WORDS;
    use kite_port::mock::MockPort;

    fn kernel() -> Kernel {
        Kernel::builder()
            .port(Arc::new(MockPort::new()))
            .build()
            .expect("kernel should build")
    }

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    #[test]
    fn builder_requires_a_port() {
        assert!(matches!(
            Kernel::builder().build(),
            Err(KernelError::InvalidState)
        ));
    }

    #[test]
    fn idle_runs_until_a_task_exists() {
        let k = kernel();
        let idle = k.idle_task();
        assert_eq!(k.current_task(), idle);
        assert_eq!(k.schedule().unwrap(), idle);

        let t = k.task_create("worker", prio(5), 64).unwrap();
        // Creation outranked idle, so the pass inside create dispatched it.
        assert_eq!(k.current_task(), t);
        assert_eq!(k.task_state(t).unwrap(), TaskState::Running);
        assert_eq!(k.task_state(idle).unwrap(), TaskState::Ready);
    }

    #[test]
    fn most_urgent_ready_task_always_wins() {
        let k = kernel();
        let low = k.task_create("low", prio(9), 64).unwrap();
        let high = k.task_create("high", prio(2), 64).unwrap();
        let mid = k.task_create("mid", prio(5), 64).unwrap();

        assert_eq!(k.current_task(), high);
        k.task_suspend(high).unwrap();
        assert_eq!(k.current_task(), mid);
        k.task_suspend(mid).unwrap();
        assert_eq!(k.current_task(), low);

        // Resume returns them at their levels; urgency order reasserts.
        k.task_resume(high).unwrap();
        k.task_resume(mid).unwrap();
        assert_eq!(k.current_task(), high);
    }

    #[test]
    fn equal_priority_round_robin_via_yield() {
        let k = kernel();
        let a = k.task_create("a", prio(4), 64).unwrap();
        let b = k.task_create("b", prio(4), 64).unwrap();
        assert_eq!(k.current_task(), a);

        // Repeated yields alternate the runner; neither starves.
        assert_eq!(k.yield_current().unwrap(), b);
        assert_eq!(k.yield_current().unwrap(), a);
        assert_eq!(k.yield_current().unwrap(), b);
        assert_eq!(k.yield_current().unwrap(), a);
    }

    #[test]
    fn task_table_capacity_is_enforced() {
        let config = KernelConfig::builder().max_tasks(3).build();
        let k = Kernel::builder()
            .config(config)
            .port(Arc::new(MockPort::new()))
            .build()
            .unwrap();
        // Idle occupies one slot.
        k.task_create("a", prio(1), 64).unwrap();
        k.task_create("b", prio(2), 64).unwrap();
        assert!(matches!(
            k.task_create("c", prio(3), 64),
            Err(KernelError::ResourceExhausted)
        ));
    }

    #[test]
    fn undersized_stack_is_rejected() {
        let k = kernel();
        assert!(matches!(
            k.task_create("tiny", prio(1), MIN_STACK_WORDS - 1),
            Err(KernelError::InvalidState)
        ));
    }

    #[test]
    fn minimum_stack_survives_a_switch_away() {
        let port = Arc::new(MockPort::new());
        let k = Kernel::builder().port(port.clone()).build().unwrap();
        let min = k.task_create("min", prio(5), MIN_STACK_WORDS).unwrap();
        assert_eq!(k.current_task(), min);

        // Dispatching a more urgent task runs the guard check on the
        // floor-sized stack; it must pass untouched.
        let hot = k.task_create("hot", prio(1), 64).unwrap();
        assert_eq!(k.current_task(), hot);
        assert!(!k.is_faulted());
        assert!(!port.reset_requested());
        assert_eq!(k.task_state(min).unwrap(), TaskState::Ready);
    }

    #[test]
    fn deleting_the_running_task_is_deferred_then_reclaimed() {
        let k = kernel();
        let t = k.task_create("doomed", prio(3), 64).unwrap();
        assert_eq!(k.current_task(), t);

        k.task_delete(t).unwrap();
        // Slot reclaimed during the pass triggered by the delete.
        assert_eq!(k.current_task(), k.idle_task());
        assert!(matches!(k.task_state(t), Err(KernelError::InvalidState)));
    }

    #[test]
    fn idle_task_cannot_be_deleted_or_suspended() {
        let k = kernel();
        let idle = k.idle_task();
        assert!(matches!(
            k.task_delete(idle),
            Err(KernelError::InvalidState)
        ));
        assert!(matches!(
            k.task_suspend(idle),
            Err(KernelError::InvalidState)
        ));
    }

    #[test]
    fn scribbled_guard_faults_at_the_switch() {
        use crate::fault::FaultKind;

        let port = Arc::new(MockPort::new());
        let k = Kernel::builder().port(port.clone()).build().unwrap();
        let t = k.task_create("victim", prio(5), 64).unwrap();
        {
            let mut state = k.state.lock();
            state.registry.tcb_mut(t).unwrap().stack.words_mut()[0] = 0xDEAD;
        }

        // The next dispatch away from the task trips the guard check.
        assert!(matches!(
            k.task_create("hi", prio(1), 64),
            Err(KernelError::StackOverflow)
        ));
        assert!(k.is_faulted());
        assert!(port.reset_requested());
        let report = k.last_fault().unwrap();
        assert_eq!(report.kind, FaultKind::StackOverflow);
        assert_eq!(report.task, Some(t));
        assert!(matches!(
            k.on_tick(),
            Err(KernelError::UnrecoverableFault)
        ));
    }

    #[test]
    fn set_priority_requeues_a_ready_task() {
        let k = kernel();
        let a = k.task_create("a", prio(4), 64).unwrap();
        let b = k.task_create("b", prio(6), 64).unwrap();
        assert_eq!(k.current_task(), a);

        // Raising b above a preempts immediately.
        k.set_priority(b, prio(2)).unwrap();
        assert_eq!(k.current_task(), b);
        assert_eq!(k.task_effective_priority(b).unwrap(), prio(2));
        assert_eq!(k.task_state(a).unwrap(), TaskState::Ready);
    }
}
