//! # kite-core
//!
//! Shared vocabulary types for the Kite real-time kernel. The scheduling
//! core (`kite-kernel`) and the hardware port contract (`kite-port`) both
//! build on these definitions.
//!
//! ## Module Overview
//! - [`priority`] – Task priority levels and the ready-set bitmap.
//! - [`time`]     – Monotonic tick clock and blocking timeouts.
//! - [`error`]    – Kernel-wide error kinds.
//!
//! The crate keeps these types free of scheduler state so that alternative
//! kernels and host-side tools can reuse the same primitives.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;
pub mod priority;
pub mod time;

pub use error::{KernelError, KernelResult};
pub use priority::{Priority, PrioritySet, PRIORITY_LEVELS};
pub use time::{TickClock, TickCount, Timeout};
