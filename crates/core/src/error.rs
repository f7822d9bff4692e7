//! Kernel-wide error kinds.

use thiserror::Error;

/// Errors surfaced by the kernel core.
///
/// The first three kinds are returned synchronously from the offending
/// call. `Timeout` and `ObjectDeleted` come back from the blocking call
/// that was interrupted. `StackOverflow` and `UnrecoverableFault` are not
/// recoverable locally; they route to fault diagnosis and terminate the
/// system after reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Priority level out of range or reserved.
    #[error("invalid priority level")]
    InvalidPriority,
    /// Task table, object pool, or message ring is full.
    #[error("kernel resource exhausted")]
    ResourceExhausted,
    /// Operation on a task or object in an incompatible state.
    #[error("operation invalid in current state")]
    InvalidState,
    /// A blocking call's deadline elapsed before the wake condition.
    #[error("blocking call timed out")]
    Timeout,
    /// The synchronization object was destroyed while waited on.
    #[error("object deleted while waited on")]
    ObjectDeleted,
    /// A task ran past its recorded stack bounds.
    #[error("task stack overflow")]
    StackOverflow,
    /// Hardware trap with no recovery path.
    #[error("unrecoverable hardware fault")]
    UnrecoverableFault,
}

pub type KernelResult<T> = Result<T, KernelError>;
