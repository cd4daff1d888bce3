//! Suspend counters and the effective-suspended predicate

use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    thread::ThreadId,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    config::FatalAction,
    locks::{LockLevel, OrderedMutex, WorldLock},
    thread::{ControllerRegion, ThreadHandle},
};

/// The independent reasons a thread can be held suspended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendReasons {
    pub suspend_all_count: u32,
    /// The thread itself is driving one of the active suspend-alls.
    pub is_controller: bool,
    pub debug_suspend_count: u32,
    pub suspend_count: u32,
}

impl SuspendReasons {
    pub fn is_effectively_suspended(&self) -> bool {
        is_effectively_suspended(
            self.suspend_all_count,
            self.is_controller,
            self.debug_suspend_count,
            self.suspend_count,
        )
    }
}

/// A thread may run only when no suspend reason is asserted.
///
/// ```
/// use threadlist::is_effectively_suspended;
///
/// assert!(is_effectively_suspended(1, false, 0, 0));
/// assert!(!is_effectively_suspended(1, true, 0, 0));
/// assert!(is_effectively_suspended(1, true, 1, 0));
/// assert!(!is_effectively_suspended(0, false, 0, 0));
/// ```
#[inline]
pub fn is_effectively_suspended(
    suspend_all_count: u32,
    is_controller: bool,
    debug_suspend_count: u32,
    suspend_count: u32,
) -> bool {
    (suspend_all_count > 0 && !is_controller) || debug_suspend_count > 0 || suspend_count > 0
}

/// One in-progress suspend-all.
pub(crate) struct Controller {
    pub(crate) os_thread: ThreadId,
    pub(crate) cause: String,
    pub(crate) started: Instant,
    /// Blocking region entered by a registered controller, left on resume.
    pub(crate) region: Option<ControllerRegion>,
}

/// Fields guarded by the suspend-state lock.
#[derive(Default)]
pub(crate) struct SuspendCounts {
    pub(crate) suspend_all_count: u32,
    pub(crate) debug_suspend_all_count: u32,
    pub(crate) controllers: Vec<Controller>,
}

impl SuspendCounts {
    pub(crate) fn take_controller(&mut self, os_thread: ThreadId) -> Option<Controller> {
        let idx = self
            .controllers
            .iter()
            .position(|c| c.os_thread == os_thread)?;
        Some(self.controllers.swap_remove(idx))
    }
}

pub(crate) struct SafepointState {
    pub(crate) counts: OrderedMutex<SuspendCounts>,
    /// Signalled when a thread leaves `Running`.
    pub(crate) suspend_cond: Condvar,
    /// Signalled when suspend counts drop.
    pub(crate) resume_cond: Condvar,
    pub(crate) world: WorldLock,
    /// Set by the current exclusive holder when its suspension may be long.
    pub(crate) long_suspend: AtomicBool,
    /// Copy of `suspend_all_count`, written under the lock, read racily.
    suspend_all_hint: AtomicU32,
    /// Threads stopped by the current exclusive holder. Only that holder
    /// writes it, and it is a leaf: nothing else is locked while it is held.
    stopped: Mutex<Vec<ThreadHandle>>,
    pub(crate) fatal_action: FatalAction,
}

impl SafepointState {
    pub(crate) fn new(fatal_action: FatalAction) -> Self {
        Self {
            counts: OrderedMutex::new(
                LockLevel::SuspendState,
                fatal_action,
                SuspendCounts::default(),
            ),
            suspend_cond: Condvar::new(),
            resume_cond: Condvar::new(),
            world: WorldLock::new(fatal_action),
            long_suspend: AtomicBool::new(false),
            suspend_all_hint: AtomicU32::new(0),
            stopped: Mutex::new(Vec::new()),
            fatal_action,
        }
    }

    /// Update `suspend_all_count`; callers hold the suspend-state lock.
    pub(crate) fn set_suspend_all_count(&self, counts: &mut SuspendCounts, value: u32) {
        counts.suspend_all_count = value;
        self.suspend_all_hint.store(value, Ordering::Release);
    }

    pub(crate) fn suspend_all_hint(&self) -> u32 {
        self.suspend_all_hint.load(Ordering::Acquire)
    }

    /// Publish the threads a new exclusive holder stopped.
    pub(crate) fn set_stopped(&self, threads: &[ThreadHandle]) {
        *self.stopped.lock() = threads.to_vec();
    }

    /// Forget the stopped set; the exclusive holder calls this before release.
    pub(crate) fn clear_stopped(&self) {
        self.stopped.lock().clear();
    }

    /// Threads stopped by the current exclusive holder.
    pub(crate) fn stopped(&self) -> Vec<ThreadHandle> {
        self.stopped.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_reason_keeps_thread_suspended() {
        let cases = [
            (SuspendReasons::default(), false),
            (
                SuspendReasons {
                    suspend_all_count: 2,
                    ..Default::default()
                },
                true,
            ),
            (
                SuspendReasons {
                    suspend_all_count: 2,
                    is_controller: true,
                    ..Default::default()
                },
                false,
            ),
            (
                SuspendReasons {
                    suspend_all_count: 1,
                    is_controller: true,
                    suspend_count: 1,
                    ..Default::default()
                },
                true,
            ),
            (
                SuspendReasons {
                    debug_suspend_count: 1,
                    ..Default::default()
                },
                true,
            ),
        ];

        for (reasons, expected) in cases {
            assert_eq!(reasons.is_effectively_suspended(), expected, "{reasons:?}");
        }
    }

    #[test]
    fn controllers_are_tracked_by_os_thread() {
        let me = std::thread::current().id();
        let mut counts = SuspendCounts::default();
        counts.controllers.push(Controller {
            os_thread: me,
            cause: "gc".into(),
            started: Instant::now(),
            region: None,
        });

        let controller = counts.take_controller(me).unwrap();
        assert_eq!(controller.cause, "gc");
        assert!(counts.controllers.is_empty());
        assert!(counts.take_controller(me).is_none());
    }
}
