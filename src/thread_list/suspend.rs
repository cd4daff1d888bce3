//! Stop-the-world and single-thread suspension

use std::{
    fmt,
    sync::atomic::Ordering,
    thread::{self, ThreadId},
    time::Instant,
};

use super::ThreadList;
use crate::{
    error::{FatalKind, SuspendError, SuspendResult, fatal},
    registry::RegistryList,
    safepoint::Controller,
    thread::{ControllerRegion, Peer, ThreadHandle, ThreadState},
};

impl ThreadList {
    /// Suspend every registered thread except the caller.
    ///
    /// Returns holding the world lock exclusively; pair with
    /// [`resume_all`](Self::resume_all) on the same thread, or use
    /// [`suspend_all_scoped`](Self::suspend_all_scoped). Threads that do not
    /// reach a safepoint within `suspend_timeout` are fatal unless
    /// `long_suspend` is set.
    pub fn suspend_all(&self, cause: &str, long_suspend: bool) {
        self.suspend_all_collect(cause, long_suspend);
    }

    /// [`suspend_all`](Self::suspend_all) returning the suspended threads.
    pub(crate) fn suspend_all_collect(&self, cause: &str, long_suspend: bool) -> Vec<ThreadHandle> {
        let started = Instant::now();
        tracing::debug!(cause, long_suspend, "suspending all threads");
        let region = ControllerRegion::enter(&self.safepoint);
        let targets = self.begin_suspend_all(cause, started, region);
        self.wait_for_suspension(&targets, cause, long_suspend);
        self.acquire_world_exclusive(cause);
        self.safepoint
            .long_suspend
            .store(long_suspend, Ordering::Release);
        self.safepoint.set_stopped(&targets);
        tracing::debug!(
            cause,
            threads = targets.len(),
            waited_ms = started.elapsed().as_millis() as u64,
            "all threads suspended"
        );
        targets
    }

    /// Resume after [`suspend_all`](Self::suspend_all).
    ///
    /// Calling this without holding the suspension is fatal.
    pub fn resume_all(&self) {
        let me = thread::current().id();
        if !self.safepoint.world.is_held_exclusively_by_current() {
            fatal(
                self.safepoint.fatal_action,
                FatalKind::UnbalancedResume,
                format_args!("resume_all on {me:?} without a matching suspend_all"),
            );
        }
        self.safepoint.clear_stopped();
        self.safepoint.long_suspend.store(false, Ordering::Release);
        self.safepoint.world.release_exclusive();

        let controller = self.end_suspend_all(me);
        let pause = controller.started.elapsed();
        self.stats.record_pause(pause);
        tracing::debug!(
            cause = %controller.cause,
            pause_ms = pause.as_millis() as u64,
            "resumed all threads"
        );
        // Leaves the controller region, which may wait out other suspensions.
        drop(controller);
    }

    /// Raise `suspend_all_count` and request suspension of every other thread.
    pub(crate) fn begin_suspend_all(
        &self,
        cause: &str,
        started: Instant,
        region: Option<ControllerRegion>,
    ) -> Vec<ThreadHandle> {
        let me = thread::current().id();
        let own = self.own_handle();
        let list = self.registry.list.lock();
        let mut counts = self.safepoint.counts.lock();

        let next = counts.suspend_all_count + 1;
        self.safepoint.set_suspend_all_count(&mut counts, next);
        if let Some(own) = &own {
            own.set_controlling(&counts, true);
        }
        counts.controllers.push(Controller {
            os_thread: me,
            cause: cause.to_string(),
            started,
            region,
        });

        let targets: Vec<ThreadHandle> = list
            .threads
            .iter()
            .filter(|t| t.os_thread() != me)
            .cloned()
            .collect();
        for thread in &targets {
            thread.refresh_suspend_flag(&counts);
        }
        targets
    }

    /// Undo [`begin_suspend_all`](Self::begin_suspend_all) and wake parked threads.
    pub(crate) fn end_suspend_all(&self, me: ThreadId) -> Controller {
        let own = self.own_handle();
        let list = self.registry.list.lock();
        let mut counts = self.safepoint.counts.lock();

        let Some(controller) = counts.take_controller(me) else {
            fatal(
                self.safepoint.fatal_action,
                FatalKind::UnbalancedResume,
                format_args!("{me:?} is not driving a suspend-all"),
            );
        };
        let next = counts.suspend_all_count - 1;
        self.safepoint.set_suspend_all_count(&mut counts, next);
        if let Some(own) = &own {
            own.set_controlling(&counts, false);
        }
        for thread in &list.threads {
            thread.refresh_suspend_flag(&counts);
        }
        self.safepoint.resume_cond.notify_all();
        controller
    }

    /// Wait until no thread in `targets` is `Running`.
    pub(crate) fn wait_for_suspension(&self, targets: &[ThreadHandle], cause: &str, long_suspend: bool) {
        let start = Instant::now();
        let deadline = (!long_suspend).then(|| start + self.config.suspend_timeout);
        let mut counts = self.safepoint.counts.lock();
        let mut timed_out = false;
        loop {
            let running: Vec<&ThreadHandle> = targets
                .iter()
                .filter(|t| t.state() == ThreadState::Running)
                .collect();
            if running.is_empty() {
                break;
            }
            if timed_out {
                let laggards = running
                    .iter()
                    .map(|t| t.describe())
                    .collect::<Vec<_>>()
                    .join("; ");
                drop(counts);
                self.fatal_with_dump(
                    FatalKind::SuspendAllTimeout,
                    format_args!(
                        "suspend all for \"{cause}\" timed out after {:?}; still running: {laggards}",
                        start.elapsed()
                    ),
                );
            }
            match deadline {
                None => counts.wait(&self.safepoint.suspend_cond),
                Some(deadline) => {
                    timed_out = counts.wait_until(&self.safepoint.suspend_cond, deadline);
                }
            }
        }
        drop(counts);
        self.stats.record_ack_wait(start.elapsed());
    }

    /// Take the world lock exclusively.
    ///
    /// Each wait is bounded by `suspend_timeout`. Expiry is fatal unless the
    /// current holder's suspension is a long one, in which case the wait
    /// starts over.
    pub(crate) fn acquire_world_exclusive(&self, cause: &str) {
        let start = Instant::now();
        loop {
            if self
                .safepoint
                .world
                .acquire_exclusive(Some(self.config.suspend_timeout))
            {
                return;
            }
            if !self.safepoint.long_suspend.load(Ordering::Acquire) {
                self.fatal_with_dump(
                    FatalKind::SuspendAllTimeout,
                    format_args!(
                        "suspend all for \"{cause}\" timed out after {:?} waiting for the world lock",
                        start.elapsed()
                    ),
                );
            }
            tracing::debug!(
                cause,
                waited_ms = start.elapsed().as_millis() as u64,
                "world lock held by a long suspension, still waiting"
            );
        }
    }

    pub(crate) fn fatal_with_dump(&self, kind: FatalKind, detail: fmt::Arguments<'_>) -> ! {
        let dump = self.dump_to_string();
        fatal(
            self.safepoint.fatal_action,
            kind,
            format_args!("{detail}\n{dump}"),
        )
    }

    /// Suspend the thread whose peer is `peer`.
    ///
    /// With `request_suspension` false nothing is raised; the call only waits
    /// for an existing request to take effect.
    pub fn suspend_thread_by_peer(
        &self,
        peer: Peer,
        request_suspension: bool,
        debug_suspension: bool,
    ) -> SuspendResult<ThreadHandle> {
        self.suspend_thread(
            |list| list.find(|t| t.peer() == Some(peer)),
            request_suspension,
            debug_suspension,
        )
    }

    pub fn suspend_thread_by_thread_id(
        &self,
        id: u16,
        debug_suspension: bool,
    ) -> SuspendResult<ThreadHandle> {
        self.suspend_thread(|list| list.find(|t| t.id() == id), true, debug_suspension)
    }

    fn suspend_thread(
        &self,
        resolve: impl Fn(&RegistryList) -> Option<ThreadHandle>,
        request_suspension: bool,
        debug_suspension: bool,
    ) -> SuspendResult<ThreadHandle> {
        let _region = ControllerRegion::enter(&self.safepoint);
        let start = Instant::now();
        let deadline = start + self.config.thread_suspend_timeout;

        let target = {
            let list = self.registry.list.lock();
            let counts = self.safepoint.counts.lock();
            let Some(target) = resolve(&list) else {
                return Err(SuspendError::ThreadNotFound);
            };
            if target.is_current() {
                return Err(SuspendError::SelfSuspension);
            }
            if request_suspension {
                target.modify_suspend_count(&counts, 1, debug_suspension);
            }
            target
        };

        loop {
            let list = self.registry.list.lock();
            let mut counts = self.safepoint.counts.lock();

            // The id or peer may now name a different thread.
            let still_registered = resolve(&list).is_some_and(|t| t.serial() == target.serial());
            if !still_registered {
                if request_suspension {
                    target.modify_suspend_count(&counts, -1, debug_suspension);
                    self.safepoint.resume_cond.notify_all();
                }
                tracing::debug!(thread_id = target.id(), "suspend target exited");
                return Err(SuspendError::ThreadNotFound);
            }
            if target.state() != ThreadState::Running {
                tracing::debug!(
                    thread_id = target.id(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    "thread suspended"
                );
                return Ok(target);
            }

            drop(list);
            let timed_out = counts.wait_until(&self.safepoint.suspend_cond, deadline);
            if timed_out && target.state() == ThreadState::Running {
                if request_suspension {
                    target.modify_suspend_count(&counts, -1, debug_suspension);
                    self.safepoint.resume_cond.notify_all();
                }
                let waited = start.elapsed();
                tracing::warn!(
                    thread_id = target.id(),
                    waited_ms = waited.as_millis() as u64,
                    "thread suspend timed out"
                );
                return Err(SuspendError::SuspendTimeout {
                    thread_id: target.id(),
                    waited,
                });
            }
        }
    }

    /// Drop one suspend request of the given kind on `thread`.
    ///
    /// Other reasons stay in effect. A thread with no outstanding request of
    /// that kind is left alone.
    pub fn resume(&self, thread: &ThreadHandle, for_debugger: bool) {
        let _region = ControllerRegion::enter(&self.safepoint);
        let counts = self.safepoint.counts.lock();
        let outstanding = if for_debugger {
            thread.debug_suspend_count()
        } else {
            thread.suspend_count()
        };
        if outstanding == 0 {
            tracing::warn!(
                thread_id = thread.id(),
                for_debugger,
                "resume of a thread with no outstanding suspend request ignored"
            );
            return;
        }
        thread.modify_suspend_count(&counts, -1, for_debugger);
        self.safepoint.resume_cond.notify_all();
    }
}
