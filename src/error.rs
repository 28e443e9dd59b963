//! Error types for RustFibers
//!
//! This module provides error handling types used throughout the library.

use thiserror::Error;

/// Main error type for RustFibers operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A scheduler contract was violated by the caller
    #[error("Scheduler invariant violated: {reason}")]
    InvariantViolation {
        /// What the caller did wrong
        reason: String,
    },

    /// The operation is not implemented by this scheduler
    #[error("Operation not supported: {operation}")]
    Unsupported {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// The fiber body panicked before producing a value
    #[error("Fiber {fiber} panicked: {message}")]
    FiberPanicked {
        /// Display form of the failed fiber
        fiber: String,
        /// Panic payload rendered as text
        message: String,
    },

    /// A join from the scheduler thread can make no further progress
    #[error("Fiber {fiber} can never terminate: nothing is ready or sleeping")]
    Stalled {
        /// Display form of the joined fiber
        fiber: String,
    },

    /// The coroutine stack could not be allocated
    #[error("Failed to allocate fiber stack: {reason}")]
    StackAllocation {
        /// Reason reported by the allocator
        reason: String,
    },

    /// Scheduler configuration was rejected
    #[error("Invalid scheduler configuration: {reason}")]
    InvalidConfig {
        /// Reason the configuration was rejected
        reason: String,
    },
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Report a contract violation.
///
/// Logs the violation and returns `InvariantViolation`; in debug builds it
/// aborts the caller with a panic first, since continuing would corrupt the
/// scheduler's bookkeeping.
pub(crate) fn violation<T>(reason: impl Into<String>) -> Result<T> {
    let reason = reason.into();
    log::error!("scheduler invariant violated: {}", reason);
    debug_assert!(false, "scheduler invariant violated: {}", reason);
    Err(Error::InvariantViolation { reason })
}

/// Fail with a contract violation unless `cond` holds.
pub(crate) fn ensure(cond: bool, reason: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        violation(reason())
    }
}
