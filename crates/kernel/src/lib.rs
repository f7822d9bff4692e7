//! # kite-kernel
//!
//! Preemptive priority scheduler, timing, and synchronization for the Kite
//! kernel. 64 priority levels with round robin among equals, a bitmap for
//! O(1) dispatch, a sorted delay ledger, counting semaphores, mutexes with
//! priority inheritance, event-flag groups, message queues, tickless idle
//! with power-mode selection, and terminal fault diagnosis.
//!
//! Everything hardware-specific is reached through the [`kite_port::Port`]
//! contract, which is what lets the whole kernel run and be tested on a
//! host: construct a [`Kernel`] over a mock port, drive `on_tick` by hand,
//! and observe dispatch through a [`TraceHook`].
//!
//! ```
//! use kite_kernel::{Kernel, Priority, Timeout};
//! use kite_port::mock::MockPort;
//! use std::sync::Arc;
//!
//! let kernel = Kernel::builder().port(Arc::new(MockPort::new())).build()?;
//! let worker = kernel.task_create("worker", Priority::new(5)?, 64)?;
//! kernel.delay(3)?;
//! for _ in 0..3 {
//!     kernel.on_tick()?;
//! }
//! assert_eq!(kernel.current_task(), worker);
//! # Ok::<(), kite_kernel::KernelError>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod fault;
pub mod ipc;
pub mod kernel;
mod ledger;
pub mod power;
mod readyq;
mod sync;
pub mod task;
pub mod time;
pub mod trace;

pub use fault::{FaultKind, FaultReport, MAX_BACKTRACE_FRAMES};
pub use ipc::event::{EventMode, EventStatus};
pub use ipc::queue::RecvStatus;
pub use ipc::{
    EventId, MutexId, PendStatus, QueueId, SemId, WaitObject, WakeReason, MAX_ISR_MESSAGE,
};
pub use kernel::{Kernel, KernelBuilder, KernelConfig, KernelConfigBuilder};
pub use power::PowerPolicy;
pub use task::{TaskId, TaskState, MIN_STACK_WORDS};
pub use trace::{SchedRecord, TraceHook};

pub use kite_core::{KernelError, KernelResult, Priority, TickCount, Timeout, PRIORITY_LEVELS};
