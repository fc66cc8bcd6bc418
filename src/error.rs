//! Error types for dispatch and flush operations.

use std::fmt;

use thiserror::Error;

/// Error returned by a blocking [`dispatch`](crate::Queue::dispatch).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue (or its pool) is shutting down and admits no new jobs.
    #[error("queue is shut down")]
    ShutDown,
}

/// Error returned by [`flush`](crate::Queue::flush).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushError {
    /// The pool was torn down, stranding queued jobs the flush barrier
    /// was waiting for.
    #[error("pool was shut down before the queue drained")]
    PoolShutDown,
}

/// Error returned by [`try_dispatch`](crate::Queue::try_dispatch).
///
/// Both variants hand the rejected closure back so the caller can retry
/// later or run it elsewhere, in the same way `crossbeam_channel`'s
/// `TrySendError` returns the unsent message.
pub enum TryDispatchError<J> {
    /// The queue is at capacity; the job was not admitted.
    Full(J),
    /// The queue (or its pool) is shutting down; the job was not admitted.
    ShutDown(J),
}

impl<J> TryDispatchError<J> {
    /// Recover the rejected closure.
    pub fn into_job(self) -> J {
        match self {
            Self::Full(job) | Self::ShutDown(job) => job,
        }
    }

    /// True if the dispatch failed because the queue was at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// True if the dispatch failed because of a shutdown.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown(_))
    }
}

// The payload is a closure, so Debug/Display are written by hand the way
// crossbeam does for TrySendError rather than derived.
impl<J> fmt::Debug for TryDispatchError<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::ShutDown(_) => f.write_str("ShutDown(..)"),
        }
    }
}

impl<J> fmt::Display for TryDispatchError<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::ShutDown(_) => f.write_str("queue is shut down"),
        }
    }
}

impl<J> std::error::Error for TryDispatchError<J> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_display() {
        let msg = format!("{}", DispatchError::ShutDown);
        assert!(msg.contains("shut down"));
    }

    #[test]
    fn test_flush_error_display() {
        let msg = format!("{}", FlushError::PoolShutDown);
        assert!(msg.contains("shut down"));
    }

    #[test]
    fn test_try_dispatch_error_hides_payload() {
        let err = TryDispatchError::Full(|| 42);
        assert_eq!(format!("{err:?}"), "Full(..)");
        assert_eq!(format!("{err}"), "queue is full");
        assert!(err.is_full());
        assert!(!err.is_shut_down());
        assert_eq!((err.into_job())(), 42);
    }

    #[test]
    fn test_try_dispatch_error_shutdown_variant() {
        let err = TryDispatchError::ShutDown(|| "unused");
        assert_eq!(format!("{err:?}"), "ShutDown(..)");
        assert!(err.is_shut_down());
        assert_eq!((err.into_job())(), "unused");
    }
}
