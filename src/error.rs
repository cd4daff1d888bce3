//! Error types for the thread list.
//!
//! Two kinds of failure exist. Recoverable ones (a single-thread suspend whose
//! target is gone or unresponsive) come back as [`SuspendError`]. Broken runtime
//! invariants (a stop-the-world that cannot complete, id exhaustion, lock-order
//! violations) are [`FatalKind`]s and never return to the caller: they go
//! through [`fatal`], which logs the diagnostic report and then aborts or
//! panics depending on [`FatalAction`].

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::config::FatalAction;

/// Recoverable errors surfaced by suspend and registration operations.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use threadlist::SuspendError;
///
/// let gone = SuspendError::ThreadNotFound;
/// assert!(!gone.is_timeout());
///
/// let slow = SuspendError::SuspendTimeout {
///     thread_id: 7,
///     waited: Duration::from_millis(250),
/// };
/// assert!(slow.is_timeout());
/// assert_eq!(slow.to_string(), "thread 7 did not suspend within 250ms");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuspendError {
    /// The target exited, is terminating, or was never registered.
    #[error("thread not found")]
    ThreadNotFound,
    /// The target stayed runnable for the whole bounded wait.
    #[error("thread {thread_id} did not suspend within {waited:?}")]
    SuspendTimeout { thread_id: u16, waited: Duration },
    /// A thread asked to suspend itself through a targeted call.
    #[error("a thread cannot suspend itself through a targeted suspend")]
    SelfSuspension,
    /// The thread list has passed its shutdown barrier.
    #[error("thread list is shutting down")]
    ShuttingDown,
}

impl SuspendError {
    /// True when the failure was an expired wait rather than a missing target.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SuspendError::SuspendTimeout { .. })
    }
}

/// Result type for recoverable thread-list operations.
pub type SuspendResult<T> = Result<T, SuspendError>;

/// Errors produced while reading configuration overrides.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Invariant violations that terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// A stop-the-world request was not acknowledged in time.
    SuspendAllTimeout,
    /// Every thread id in the configured space is in use.
    ThreadIdsExhausted,
    /// An OS thread registered twice.
    DoubleRegistration,
    /// A lock was acquired out of the fixed order.
    LockOrderViolation,
    /// `resume_all` without a matching `suspend_all` on this thread.
    UnbalancedResume,
    /// A suspend counter would have gone negative.
    CounterUnderflow,
    /// A thread-owned transition was attempted from another OS thread.
    ForeignThread,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FatalKind::SuspendAllTimeout => "suspend-all timeout",
            FatalKind::ThreadIdsExhausted => "thread ids exhausted",
            FatalKind::DoubleRegistration => "double registration",
            FatalKind::LockOrderViolation => "lock order violation",
            FatalKind::UnbalancedResume => "unbalanced resume",
            FatalKind::CounterUnderflow => "suspend counter underflow",
            FatalKind::ForeignThread => "foreign thread",
        };
        f.write_str(text)
    }
}

/// Report a broken runtime invariant and stop.
///
/// The report is always logged at error level first. With
/// [`FatalAction::Abort`] the process aborts after echoing the report to
/// stderr; with [`FatalAction::Panic`] the calling thread panics with the
/// report as payload, which keeps fatal paths observable in tests.
#[cold]
#[track_caller]
pub(crate) fn fatal(action: FatalAction, kind: FatalKind, detail: impl fmt::Display) -> ! {
    let report = format!("fatal runtime error ({kind}): {detail}");
    tracing::error!(kind = %kind, "{report}");
    match action {
        FatalAction::Abort => {
            eprintln!("{report}");
            std::process::abort()
        }
        FatalAction::Panic => panic!("{report}"),
    }
}
