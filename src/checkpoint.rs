//! Checkpoint work items and a completion barrier.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::thread::ThreadHandle;

/// Work run once per target thread at its next safepoint poll, or by the
/// requester on behalf of a thread that is already suspended.
///
/// Implementations must not block indefinitely and must not call back into
/// the [`ThreadList`](crate::ThreadList).
pub trait Checkpoint: Send + Sync {
    fn run(&self, thread: &ThreadHandle);
}

impl<F> Checkpoint for F
where
    F: Fn(&ThreadHandle) + Send + Sync,
{
    fn run(&self, thread: &ThreadHandle) {
        self(thread)
    }
}

/// Counts checkpoint completions so the requester can wait for them.
///
/// # Examples
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use threadlist::CheckpointBarrier;
///
/// let barrier = Arc::new(CheckpointBarrier::new());
/// let worker = {
///     let barrier = barrier.clone();
///     std::thread::spawn(move || barrier.pass())
/// };
/// assert!(barrier.wait(1, Duration::from_secs(5)));
/// worker.join().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct CheckpointBarrier {
    passed: Mutex<usize>,
    cond: Condvar,
}

impl CheckpointBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one completion.
    pub fn pass(&self) {
        *self.passed.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait for `count` completions and consume them.
    ///
    /// Returns false if `timeout` expired first; nothing is consumed then.
    /// A registered thread should wait inside
    /// [`ThreadHandle::blocking`] so it does not hold up a suspend-all.
    pub fn wait(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut passed = self.passed.lock();
        while *passed < count {
            if self.cond.wait_until(&mut passed, deadline).timed_out() && *passed < count {
                return false;
            }
        }
        *passed -= count;
        true
    }

    /// Completions not yet consumed by [`wait`](Self::wait).
    pub fn passed(&self) -> usize {
        *self.passed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_consumes_completions() {
        let barrier = CheckpointBarrier::new();
        barrier.pass();
        barrier.pass();
        barrier.pass();
        assert!(barrier.wait(2, Duration::from_millis(10)));
        assert_eq!(barrier.passed(), 1);
    }

    #[test]
    fn wait_times_out_without_consuming() {
        let barrier = CheckpointBarrier::new();
        barrier.pass();
        assert!(!barrier.wait(2, Duration::from_millis(10)));
        assert_eq!(barrier.passed(), 1);
    }

    #[test]
    fn wait_sees_passes_from_other_threads() {
        let barrier = Arc::new(CheckpointBarrier::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || barrier.pass())
            })
            .collect();

        assert!(barrier.wait(4, Duration::from_secs(5)));
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(barrier.passed(), 0);
    }
}
