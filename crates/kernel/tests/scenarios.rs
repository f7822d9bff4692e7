//! End-to-end scheduling scenarios driven through the public API.

use std::sync::{Arc, Mutex};

use kite_kernel::{
    EventMode, EventStatus, Kernel, KernelConfig, KernelError, PendStatus, Priority, RecvStatus,
    SchedRecord, TaskState, Timeout, WakeReason,
};
use kite_port::mock::{MockPort, PortCall};

fn prio(level: u8) -> Priority {
    Priority::new(level).unwrap()
}

fn kernel_with(port: Arc<MockPort>) -> Kernel {
    Kernel::builder().port(port).build().unwrap()
}

fn kernel() -> Kernel {
    kernel_with(Arc::new(MockPort::new()))
}

/// Installs a hook that records every scheduling event.
fn recording(kernel: &Kernel) -> Arc<Mutex<Vec<SchedRecord>>> {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = records.clone();
    kernel.set_trace_hook(Some(Arc::new(move |r: &SchedRecord| {
        sink.lock().unwrap().push(r.clone());
    })));
    records
}

#[test]
fn three_level_priority_inversion_is_bounded() {
    let k = kernel();
    let m = k.mutex_create().unwrap();

    // Classic 1/5/10 setup: the least urgent task takes the lock first.
    let low = k.task_create("low", prio(10), 64).unwrap();
    assert_eq!(k.mutex_lock(m, Timeout::Forever).unwrap(), PendStatus::Acquired);

    // A busy middle task would normally starve the lock holder.
    let mid = k.task_create("mid", prio(5), 64).unwrap();
    assert_eq!(k.current_task(), mid);

    // The most urgent task arrives and blocks on the mutex.
    let high = k.task_create("high", prio(1), 64).unwrap();
    assert_eq!(k.current_task(), high);
    assert_eq!(k.mutex_lock(m, Timeout::Forever).unwrap(), PendStatus::Blocked);

    // Inheritance: the holder now outranks the middle task and runs.
    assert_eq!(k.current_task(), low);
    assert_eq!(k.task_effective_priority(low).unwrap(), prio(1));
    assert_eq!(k.task_state(mid).unwrap(), TaskState::Ready);

    // Ticks pass; mid still cannot wedge itself in front of the holder.
    for _ in 0..5 {
        k.on_tick().unwrap();
        assert_eq!(k.current_task(), low);
    }

    // Release: the lock moves to high, the boost is gone, and only after
    // high is done does mid get the CPU ahead of low.
    k.mutex_unlock(m).unwrap();
    assert_eq!(k.current_task(), high);
    assert_eq!(k.mutex_owner(m).unwrap(), Some(high));
    assert_eq!(k.task_effective_priority(low).unwrap(), prio(10));

    k.mutex_unlock(m).unwrap();
    k.task_suspend(high).unwrap();
    assert_eq!(k.current_task(), mid);
}

#[test]
fn semaphore_timeout_leaves_no_trace_on_the_wait_list() {
    let k = kernel();
    let s = k.sem_create(0, 8).unwrap();

    // Three tasks at descending urgency; the first two go to sleep so
    // the least urgent one reaches the semaphore with an empty ready
    // queue behind it.
    let t1 = k.task_create("t1", prio(1), 64).unwrap();
    k.delay(1_000).unwrap();
    let t2 = k.task_create("t2", prio(2), 64).unwrap();
    k.delay(1_000).unwrap();
    let t3 = k.task_create("t3", prio(3), 64).unwrap();
    assert_eq!(k.current_task(), t3);

    assert_eq!(
        k.sem_pend(s, Timeout::Ticks(100)).unwrap(),
        PendStatus::Blocked
    );
    assert_eq!(k.sem_waiters(s).unwrap(), vec![t3]);
    assert_eq!(k.current_task(), k.idle_task());

    for n in 1..=99 {
        k.on_tick().unwrap();
        assert_eq!(k.task_state(t3).unwrap(), TaskState::Blocked, "tick {n}");
    }
    k.on_tick().unwrap();

    // Woken by the deadline, not by a post; the sleepers stay asleep.
    assert_eq!(k.current_task(), t3);
    assert_eq!(k.take_wake_reason(t3).unwrap(), Some(WakeReason::Timeout));
    assert!(k.sem_waiters(s).unwrap().is_empty());
    assert_eq!(k.task_state(t1).unwrap(), TaskState::Delayed);
    assert_eq!(k.task_state(t2).unwrap(), TaskState::Delayed);

    // A later post must find nobody to wake and bump the count instead.
    k.sem_post(s).unwrap();
    assert_eq!(k.sem_count(s).unwrap(), 1);
}

#[test]
fn round_robin_shares_ticks_between_equals() {
    let k = kernel();
    let records = recording(&k);
    let a = k.task_create("a", prio(6), 64).unwrap();
    let b = k.task_create("b", prio(6), 64).unwrap();
    records.lock().unwrap().clear();

    for _ in 0..6 {
        k.on_tick().unwrap();
    }

    let switches: Vec<(_, _)> = records
        .lock()
        .unwrap()
        .iter()
        .filter_map(|r| match r {
            SchedRecord::Switch { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    // Strict alternation, one rotation per tick.
    assert_eq!(
        switches,
        vec![(a, b), (b, a), (a, b), (b, a), (a, b), (b, a)]
    );
}

#[test]
fn blocking_emits_a_coherent_trace() {
    let k = kernel();
    let idle = k.idle_task();
    let t = k.task_create("t", prio(3), 64).unwrap();
    let records = recording(&k);

    k.delay(2).unwrap();
    k.on_tick().unwrap();
    k.on_tick().unwrap();
    k.set_trace_hook(None);

    let got = records.lock().unwrap().clone();
    assert_eq!(
        got,
        vec![
            SchedRecord::Sleep(t),
            SchedRecord::Switch { from: t, to: idle },
            SchedRecord::Tick(1),
            SchedRecord::Tick(2),
            SchedRecord::Ready(t),
            SchedRecord::Switch { from: idle, to: t },
        ]
    );
}

#[test]
fn deferred_isr_posts_apply_in_one_pass() {
    let k = kernel();
    let s = k.sem_create(0, 4).unwrap();
    let e = k.event_create(0).unwrap();
    let q = k.queue_create(4, 2).unwrap();

    let rx = k.task_create("rx", prio(2), 64).unwrap();
    k.queue_receive(q, Timeout::Forever).unwrap();
    let waiter = k.task_create("waiter", prio(3), 64).unwrap();
    k.event_wait(e, 0b1, EventMode::Any, true, Timeout::Forever)
        .unwrap();

    // Interrupt context fires a burst of posts; nothing moves yet.
    k.sem_post_isr(s).unwrap();
    k.event_set_isr(e, 0b1).unwrap();
    k.queue_send_isr(q, b"ok").unwrap();
    assert_eq!(k.task_state(rx).unwrap(), TaskState::Blocked);
    assert_eq!(k.task_state(waiter).unwrap(), TaskState::Blocked);
    assert_eq!(k.sem_count(s).unwrap(), 0);

    // One scheduler pass drains the ring and dispatches the most urgent.
    k.schedule().unwrap();
    assert_eq!(k.current_task(), rx);
    assert_eq!(
        k.take_wake_reason(rx).unwrap(),
        Some(WakeReason::Message(b"ok".to_vec()))
    );
    assert_eq!(
        k.take_wake_reason(waiter).unwrap(),
        Some(WakeReason::Events(0b1))
    );
    assert_eq!(k.sem_count(s).unwrap(), 1);
}

#[test]
fn tickless_sleep_in_clamped_chunks_reaches_the_wake() {
    let port = Arc::new(MockPort::with_limits(30, true));
    let k = kernel_with(port.clone());
    let t = k.task_create("sleeper", prio(5), 64).unwrap();
    k.delay(100).unwrap();

    // 100 ticks of idle, hardware capped at 30 per stretch.
    let mut windows = Vec::new();
    while k.current_task() == k.idle_task() {
        let window = k.idle_window().expect("still idle, a wake is pending");
        k.enter_idle().unwrap();
        k.resume_from_idle(window).unwrap();
        windows.push(window);
    }

    assert_eq!(windows, vec![30, 30, 30, 10]);
    assert_eq!(k.now(), 100);
    assert_eq!(k.current_task(), t);

    // Each stretch suspended the periodic timer and resumed it after.
    let calls = port.calls();
    assert_eq!(
        calls.iter().filter(|c| **c == PortCall::TimerSuspend).count(),
        4
    );
    assert_eq!(
        calls.iter().filter(|c| **c == PortCall::TimerResume).count(),
        4
    );
    assert!(calls.contains(&PortCall::TimerReloadOnce(30)));
    assert!(calls.contains(&PortCall::TimerReloadOnce(10)));
}

#[test]
fn producer_consumer_handoff_over_a_queue() {
    let k = kernel();
    let q = k.queue_create(2, 4).unwrap();

    // Urgent consumer blocks first.
    let consumer = k.task_create("consumer", prio(2), 64).unwrap();
    assert_eq!(
        k.queue_receive(q, Timeout::Forever).unwrap(),
        RecvStatus::Blocked
    );

    // Producer runs, sends, and is immediately preempted by the wake.
    let producer = k.task_create("producer", prio(8), 64).unwrap();
    assert_eq!(k.current_task(), producer);
    k.queue_send(q, b"pkt1").unwrap();
    assert_eq!(k.current_task(), consumer);
    assert_eq!(
        k.take_wake_reason(consumer).unwrap(),
        Some(WakeReason::Message(b"pkt1".to_vec()))
    );

    // With the consumer busy, further sends buffer in order.
    k.task_suspend(consumer).unwrap();
    k.queue_send(q, b"pkt2").unwrap();
    k.queue_send(q, b"pkt3").unwrap();
    assert_eq!(k.queue_len(q).unwrap(), 2);
    k.task_resume(consumer).unwrap();
    assert_eq!(
        k.queue_receive(q, Timeout::NoWait).unwrap(),
        RecvStatus::Received(b"pkt2".to_vec())
    );
}

#[test]
fn event_rendezvous_with_all_matching() {
    let k = kernel();
    let e = k.event_create(0).unwrap();
    let t = k.task_create("t", prio(3), 64).unwrap();

    assert_eq!(
        k.event_wait(e, 0b11, EventMode::All, true, Timeout::Forever)
            .unwrap(),
        EventStatus::Blocked
    );

    // First half of the condition is not enough.
    k.event_set(e, 0b01).unwrap();
    assert_eq!(k.task_state(t).unwrap(), TaskState::Blocked);

    k.event_set(e, 0b10).unwrap();
    assert_eq!(k.current_task(), t);
    assert_eq!(
        k.take_wake_reason(t).unwrap(),
        Some(WakeReason::Events(0b11))
    );
    assert_eq!(k.event_bits(e).unwrap(), 0);
}

#[test]
fn wake_order_on_mass_release_is_priority_then_fifo() {
    let config = KernelConfig::builder().max_tasks(8).build();
    let k = Kernel::builder()
        .config(config)
        .port(Arc::new(MockPort::new()))
        .build()
        .unwrap();
    let s = k.sem_create(0, 8).unwrap();

    // Four penders: two urgent (FIFO between them), two relaxed.
    let pend = |name, level| {
        let t = k.task_create(name, prio(level), 64).unwrap();
        k.sem_pend(s, Timeout::Forever).unwrap();
        t
    };
    let a = pend("a", 5);
    let b = pend("b", 2);
    let c = pend("c", 5);
    let d = pend("d", 2);

    assert_eq!(k.sem_waiters(s).unwrap(), vec![b, d, a, c]);
    for expected in [b, d, a, c] {
        k.sem_post(s).unwrap();
        assert_eq!(
            k.take_wake_reason(expected).unwrap(),
            Some(WakeReason::Acquired)
        );
    }
}

#[test]
fn delete_during_pend_resumes_with_deleted() {
    let k = kernel();
    let s = k.sem_create(0, 1).unwrap();
    let t = k.task_create("t", prio(4), 64).unwrap();
    k.sem_pend(s, Timeout::Ticks(50)).unwrap();

    k.sem_delete(s).unwrap();
    assert_eq!(k.current_task(), t);
    let reason = k.take_wake_reason(t).unwrap().unwrap();
    assert_eq!(reason, WakeReason::Deleted);
    assert!(matches!(
        reason.into_result(),
        Err(KernelError::ObjectDeleted)
    ));

    // The stale ledger entry must not resurrect the task at tick 50.
    for _ in 0..50 {
        k.on_tick().unwrap();
    }
    assert_eq!(k.task_state(t).unwrap(), TaskState::Running);
    assert!(matches!(
        k.sem_pend(s, Timeout::NoWait),
        Err(KernelError::InvalidState)
    ));
}
