//! Platform locking for kernel-internal state.
//!
//! On hardware, the kernel's shared structures are protected by masking the
//! interrupts that touch them; on hosted builds this module stands in for
//! that masking with a real mutex. Lock scope must stay O(1) queue and
//! bitmap work and never span a blocking call — the same rule the masked
//! critical sections obey on target.

#[cfg(not(feature = "std"))]
pub use alloc::sync::Arc;
#[cfg(feature = "std")]
pub use std::sync::Arc;

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Kernel critical-section lock.
///
/// `std::sync::Mutex` under the `std` feature, `spin::Mutex` otherwise.
pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: std::sync::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: std::sync::Mutex::new(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// # Panics
    ///
    /// In `std` mode, panics on poisoning. A panic inside a kernel critical
    /// section leaves the scheduler state untrustworthy, so there is
    /// nothing sensible to recover to.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(feature = "std")]
        {
            self.inner.lock().expect("kernel state mutex poisoned")
        }
        #[cfg(not(feature = "std"))]
        {
            self.inner.lock()
        }
    }
}
