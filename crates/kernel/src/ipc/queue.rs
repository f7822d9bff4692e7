//! Fixed-size message queues.
//!
//! Storage is a flat ring of `depth * msg_size` bytes allocated once at
//! creation; send and receive copy whole messages. A send with receivers
//! blocked bypasses the ring and delivers straight to the head waiter, so
//! a non-empty wait list implies an empty ring.

use alloc::vec;
use alloc::vec::Vec;

use kite_core::{KernelError, KernelResult, Timeout};

use crate::ipc::{DeferredPost, QueueId, WaitList, WaitObject, WakeReason};
use crate::kernel::{Kernel, KernelState};
use crate::trace::SchedRecord;

/// Immediate outcome of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvStatus {
    /// A message was ready and copied out.
    Received(Vec<u8>),
    /// Suspended until a message arrives (or timeout/delete); the message
    /// comes back as [`WakeReason::Message`].
    Blocked,
}

pub(crate) struct MsgRing {
    buf: Vec<u8>,
    msg_size: usize,
    depth: usize,
    head: usize,
    len: usize,
}

impl MsgRing {
    fn new(depth: usize, msg_size: usize) -> Self {
        Self {
            buf: vec![0; depth * msg_size],
            msg_size,
            depth,
            head: 0,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == self.depth
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, msg: &[u8]) {
        debug_assert!(!self.is_full());
        let slot = (self.head + self.len) % self.depth;
        let at = slot * self.msg_size;
        self.buf[at..at + self.msg_size].copy_from_slice(msg);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let at = self.head * self.msg_size;
        let msg = self.buf[at..at + self.msg_size].to_vec();
        self.head = (self.head + 1) % self.depth;
        self.len -= 1;
        Some(msg)
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

pub(crate) struct QueueObj {
    pub(crate) ring: MsgRing,
    pub(crate) waiters: WaitList<()>,
}

impl Kernel {
    /// Creates a queue of `depth` messages of exactly `msg_size` bytes.
    pub fn queue_create(&self, depth: usize, msg_size: usize) -> KernelResult<QueueId> {
        if depth == 0 || msg_size == 0 {
            return Err(KernelError::InvalidState);
        }
        let mut state = self.state.lock();
        state
            .queues
            .insert(QueueObj {
                ring: MsgRing::new(depth, msg_size),
                waiters: WaitList::new(),
            })
            .map(QueueId)
    }

    /// Sends one message. Delivers directly to the head receiver when one
    /// is blocked; otherwise appends to the ring, failing fast when full.
    pub fn queue_send(&self, queue: QueueId, msg: &[u8]) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.queue_send_locked(&mut state, queue, msg, &mut notes)
                .and_then(|_| self.maybe_resched(&mut state, &mut notes))
                .map(|_| ())
        };
        self.finish(notes, result)
    }

    /// Interrupt-context send. The message is copied into the deferral
    /// ring (at most [`crate::ipc::MAX_ISR_MESSAGE`] bytes) and applied
    /// at the next scheduler pass.
    pub fn queue_send_isr(&self, queue: QueueId, msg: &[u8]) -> KernelResult<()> {
        let payload =
            heapless::Vec::from_slice(msg).map_err(|_| KernelError::InvalidState)?;
        self.push_deferred(DeferredPost::Queue(queue, payload))
    }

    pub(crate) fn queue_send_locked(
        &self,
        state: &mut KernelState,
        queue: QueueId,
        msg: &[u8],
        notes: &mut Vec<SchedRecord>,
    ) -> KernelResult<()> {
        {
            let obj = state.queues.get(queue.0)?;
            if msg.len() != obj.ring.msg_size {
                return Err(KernelError::InvalidState);
            }
        }
        let receiver = state.queues.get_mut(queue.0)?.waiters.pop_front();
        match receiver {
            Some((task, ())) => {
                self.wake_waiter(state, task, WakeReason::Message(msg.to_vec()), notes)
            }
            None => {
                let obj = state.queues.get_mut(queue.0)?;
                if obj.ring.is_full() {
                    return Err(KernelError::ResourceExhausted);
                }
                obj.ring.push(msg);
                Ok(())
            }
        }
    }

    /// Receives the oldest message, or suspends the caller until one is
    /// sent.
    pub fn queue_receive(&self, queue: QueueId, timeout: Timeout) -> KernelResult<RecvStatus> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let popped = state.queues.get_mut(queue.0)?.ring.pop();
            if let Some(msg) = popped {
                Ok(RecvStatus::Received(msg))
            } else if !timeout.may_block() {
                Err(KernelError::Timeout)
            } else {
                let (cur, prio, seq) =
                    self.block_current(&mut state, WaitObject::Queue(queue), timeout, &mut notes)?;
                state
                    .queues
                    .get_mut(queue.0)?
                    .waiters
                    .insert(cur, prio, seq, ());
                self.reschedule(&mut state, &mut notes)
                    .map(|_| RecvStatus::Blocked)
            }
        };
        self.finish(notes, result)
    }

    /// Discards every buffered message. Waiters are untouched: a waiter
    /// means the ring is already empty.
    pub fn queue_flush(&self, queue: QueueId) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.queues.get_mut(queue.0)?.ring.clear();
        Ok(())
    }

    /// Number of buffered messages.
    pub fn queue_len(&self, queue: QueueId) -> KernelResult<usize> {
        Ok(self.state.lock().queues.get(queue.0)?.ring.len)
    }

    /// Destroys the queue; every waiting receiver resumes with
    /// [`WakeReason::Deleted`].
    pub fn queue_delete(&self, queue: QueueId) -> KernelResult<()> {
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let mut obj = state.queues.remove(queue.0)?;
            for (task, ()) in obj.waiters.drain_all() {
                self.wake_waiter(&mut state, task, WakeReason::Deleted, &mut notes)?;
            }
            self.maybe_resched(&mut state, &mut notes).map(|_| ())
        };
        self.finish(notes, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::MAX_ISR_MESSAGE;
    use crate::sync::Arc;
    use crate::task::TaskState;
    use kite_core::Priority;
    use kite_port::mock::MockPort;

    fn kernel() -> Kernel {
        Kernel::builder()
            .port(Arc::new(MockPort::new()))
            .build()
            .unwrap()
    }

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    #[test]
    fn fifo_order_through_the_ring() {
        let k = kernel();
        let q = k.queue_create(3, 4).unwrap();
        let _t = k.task_create("t", prio(5), 64).unwrap();

        k.queue_send(q, b"aaaa").unwrap();
        k.queue_send(q, b"bbbb").unwrap();
        assert_eq!(k.queue_len(q).unwrap(), 2);

        assert_eq!(
            k.queue_receive(q, Timeout::NoWait).unwrap(),
            RecvStatus::Received(b"aaaa".to_vec())
        );
        assert_eq!(
            k.queue_receive(q, Timeout::NoWait).unwrap(),
            RecvStatus::Received(b"bbbb".to_vec())
        );
        assert!(matches!(
            k.queue_receive(q, Timeout::NoWait),
            Err(KernelError::Timeout)
        ));
    }

    #[test]
    fn send_to_a_full_queue_fails_fast() {
        let k = kernel();
        let q = k.queue_create(1, 2).unwrap();
        k.queue_send(q, b"ab").unwrap();
        assert!(matches!(
            k.queue_send(q, b"cd"),
            Err(KernelError::ResourceExhausted)
        ));
        k.queue_flush(q).unwrap();
        assert_eq!(k.queue_len(q).unwrap(), 0);
        k.queue_send(q, b"cd").unwrap();
    }

    #[test]
    fn wrong_message_size_is_rejected() {
        let k = kernel();
        let q = k.queue_create(2, 4).unwrap();
        assert!(matches!(
            k.queue_send(q, b"toolong!"),
            Err(KernelError::InvalidState)
        ));
    }

    #[test]
    fn send_delivers_directly_to_a_blocked_receiver() {
        let k = kernel();
        let q = k.queue_create(2, 3).unwrap();
        let t = k.task_create("rx", prio(4), 64).unwrap();
        assert_eq!(
            k.queue_receive(q, Timeout::Forever).unwrap(),
            RecvStatus::Blocked
        );

        k.queue_send(q, b"msg").unwrap();
        assert_eq!(k.current_task(), t);
        assert_eq!(
            k.take_wake_reason(t).unwrap(),
            Some(WakeReason::Message(b"msg".to_vec()))
        );
        // Bypassed the ring entirely.
        assert_eq!(k.queue_len(q).unwrap(), 0);
    }

    #[test]
    fn receive_timeout_leaves_no_waiter_behind() {
        let k = kernel();
        let q = k.queue_create(1, 1).unwrap();
        let t = k.task_create("rx", prio(4), 64).unwrap();
        k.queue_receive(q, Timeout::Ticks(2)).unwrap();
        assert_eq!(k.task_state(t).unwrap(), TaskState::Blocked);

        k.on_tick().unwrap();
        k.on_tick().unwrap();
        assert_eq!(k.take_wake_reason(t).unwrap(), Some(WakeReason::Timeout));
        // A later send buffers instead of waking anyone.
        k.queue_send(q, b"x").unwrap();
        assert_eq!(k.queue_len(q).unwrap(), 1);
    }

    #[test]
    fn isr_send_rejects_oversized_payloads() {
        let k = kernel();
        let q = k.queue_create(1, MAX_ISR_MESSAGE + 1).unwrap();
        let big = alloc::vec![0u8; MAX_ISR_MESSAGE + 1];
        assert!(matches!(
            k.queue_send_isr(q, &big),
            Err(KernelError::InvalidState)
        ));
    }
}
