//! Debugger-driven suspension.
//!
//! Debugger requests are counted separately from collector suspensions: a
//! per-thread debug count plus `debug_suspend_all_count`, which threads
//! registering later inherit. Either kind can outlive the other.

use std::{thread, time::Instant};

use super::ThreadList;
use crate::{
    error::{FatalKind, SuspendError, SuspendResult, fatal},
    thread::{ControllerRegion, ThreadHandle, ThreadState},
};

impl ThreadList {
    /// Suspend every thread except the caller and debugger agents.
    ///
    /// If some thread stays `Running` past `suspend_timeout` the request is
    /// withdrawn and [`SuspendError::SuspendTimeout`] names that thread.
    pub fn suspend_all_for_debugger(&self) -> SuspendResult<()> {
        let _region = ControllerRegion::enter(&self.safepoint);
        let me = thread::current().id();
        let start = Instant::now();

        let targets: Vec<ThreadHandle> = {
            let list = self.registry.list.lock();
            let mut counts = self.safepoint.counts.lock();
            counts.debug_suspend_all_count += 1;
            let targets: Vec<ThreadHandle> = list
                .threads
                .iter()
                .filter(|t| t.os_thread() != me && !t.is_debugger_agent())
                .cloned()
                .collect();
            for thread in &targets {
                thread.modify_suspend_count(&counts, 1, true);
            }
            targets
        };

        let deadline = start + self.config.suspend_timeout;
        let mut counts = self.safepoint.counts.lock();
        let mut timed_out = false;
        loop {
            let Some(laggard) = targets.iter().find(|t| t.state() == ThreadState::Running) else {
                break;
            };
            if timed_out {
                let thread_id = laggard.id();
                drop(counts);
                let waited = start.elapsed();
                tracing::warn!(
                    thread_id,
                    waited_ms = waited.as_millis() as u64,
                    "suspend all for debugger timed out, withdrawing"
                );
                self.release_debugger_suspend_all();
                return Err(SuspendError::SuspendTimeout { thread_id, waited });
            }
            timed_out = counts.wait_until(&self.safepoint.suspend_cond, deadline);
        }
        drop(counts);

        tracing::debug!(
            threads = targets.len(),
            waited_ms = start.elapsed().as_millis() as u64,
            "all threads suspended for debugger"
        );
        Ok(())
    }

    /// Withdraw one [`suspend_all_for_debugger`](Self::suspend_all_for_debugger).
    ///
    /// More resumes than suspends is fatal.
    pub fn resume_all_for_debugger(&self) {
        let _region = ControllerRegion::enter(&self.safepoint);
        self.release_debugger_suspend_all();
        tracing::debug!("resumed all threads for debugger");
    }

    fn release_debugger_suspend_all(&self) {
        let me = thread::current().id();
        let list = self.registry.list.lock();
        let mut counts = self.safepoint.counts.lock();
        if counts.debug_suspend_all_count == 0 {
            fatal(
                self.safepoint.fatal_action,
                FatalKind::CounterUnderflow,
                "resume_all_for_debugger without a matching suspend_all_for_debugger",
            );
        }
        counts.debug_suspend_all_count -= 1;
        for thread in list
            .threads
            .iter()
            .filter(|t| t.os_thread() != me && !t.is_debugger_agent())
        {
            // Threads already resumed individually have nothing left to drop.
            if thread.debug_suspend_count() > 0 {
                thread.modify_suspend_count(&counts, -1, true);
            }
        }
        self.safepoint.resume_cond.notify_all();
    }

    /// Drop every debugger suspension of every thread but the caller.
    pub fn undo_debugger_suspensions(&self) {
        let _region = ControllerRegion::enter(&self.safepoint);
        let me = thread::current().id();
        let list = self.registry.list.lock();
        let mut counts = self.safepoint.counts.lock();
        counts.debug_suspend_all_count = 0;
        for thread in list.threads.iter().filter(|t| t.os_thread() != me) {
            thread.clear_debug_suspend_count(&counts);
        }
        self.safepoint.resume_cond.notify_all();
        tracing::debug!("undid debugger suspensions");
    }

    /// Suspend the calling thread on behalf of the debugger.
    ///
    /// A running caller parks until a debugger resume drops its debug count.
    /// A caller already outside `Running` parks when it next returns to it.
    pub fn suspend_self_for_debugger(&self) -> SuspendResult<()> {
        let Some(me) = self.own_handle() else {
            return Err(SuspendError::ThreadNotFound);
        };
        let was_running = me.state() == ThreadState::Running;
        if was_running {
            me.enter_blocking();
        }
        {
            let counts = self.safepoint.counts.lock();
            me.modify_suspend_count(&counts, 1, true);
        }
        tracing::debug!(thread_id = me.id(), "thread suspended itself for debugger");
        if was_running {
            me.exit_blocking();
        }
        Ok(())
    }
}
